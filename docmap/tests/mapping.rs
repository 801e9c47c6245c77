use std::sync::Arc;

use docmap::{
    client::{DocumentStoreClient, SetOptions},
    memory::InMemoryStore,
    post_process,
    prelude::*,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Entity)]
struct User {
    id: String,
    name: String,
    #[serde(default)]
    age: i32,
    #[serde(default)]
    messages: SubCollection<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Entity)]
#[entity(name = "Message")]
struct Message {
    #[entity(id)]
    key: String,
    text: String,
}

fn user(name: &str, age: i32) -> User {
    User {
        name: name.into(),
        age,
        ..Default::default()
    }
}

fn mapper() -> (DocumentMapper, InMemoryStore) {
    let store = InMemoryStore::new();
    let mapper = DocumentMapper::builder(store.clone())
        .registry(Arc::new(MetadataRegistry::new()))
        .build();

    mapper.register_collection::<User>(None).unwrap();
    mapper
        .register_sub_collection::<User, Message>("messages", Some("messages"))
        .unwrap();

    (mapper, store)
}

#[tokio::test]
async fn sub_collections_are_reached_through_bound_accessors() {
    let (mapper, store) = mapper();
    let users = mapper.repository::<User>().unwrap();

    let ada = users.create(user("Ada", 36)).await.unwrap();
    let message = ada
        .messages
        .repository()
        .unwrap()
        .create(Message { text: "hello".into(), ..Default::default() })
        .await
        .unwrap();

    let path = format!("users/{}/messages/{}", ada.id, message.key);
    let stored = store.get_document(&path).await.unwrap().unwrap();
    assert_eq!(stored.data.get_str("text").unwrap(), "hello");
    let parent = store.get_document(&format!("users/{}", ada.id)).await.unwrap().unwrap();
    assert!(!parent.data.contains_key("messages"));

    let found = users.find_by_id(&ada.id).await.unwrap().unwrap();
    let inbox = found.messages.repository().unwrap().find().await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].key, message.key);
}

#[tokio::test]
async fn entities_created_from_one_template_keep_their_own_messages() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();
    let template = user("Template", 1);

    let first = users.create(template.clone()).await.unwrap();
    let second = users.create(template.clone()).await.unwrap();
    assert_eq!(first.messages.path(), Some(format!("users/{}/messages", first.id)));

    first
        .messages
        .repository()
        .unwrap()
        .create(Message { text: "mine".into(), ..Default::default() })
        .await
        .unwrap();

    let theirs = second.messages.repository().unwrap().find().await.unwrap();
    let mine = first.messages.repository().unwrap().find().await.unwrap();
    assert!(theirs.is_empty());
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn queries_filter_order_and_page() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();

    assert!(users.find_one().await.unwrap().is_none());

    for (name, age) in [("Ada", 36), ("Grace", 45), ("Linus", 21), ("Barbara", 30)] {
        users.create(user(name, age)).await.unwrap();
    }

    let names: Vec<_> = users
        .where_greater_than("age", 25)
        .order_by_descending("age")
        .unwrap()
        .find()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.name)
        .collect();
    assert_eq!(names, ["Grace", "Ada", "Barbara"]);

    let page: Vec<_> = users
        .order_by_ascending("age")
        .unwrap()
        .offset(1)
        .unwrap()
        .limit(2)
        .unwrap()
        .find()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.age)
        .collect();
    assert_eq!(page, [30, 36]);

    let youngest = users.order_by_ascending("age").unwrap().find_one().await.unwrap().unwrap();
    assert_eq!(youngest.name, "Linus");

    let named = users.where_in("name", ["Ada", "Linus"]).unwrap().find().await.unwrap();
    assert_eq!(named.len(), 2);
}

#[tokio::test]
async fn pipes_run_after_the_store_query() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();
    for (name, age) in [("Ada Lovelace", 36), ("Grace Hopper", 45), ("Ada Yonath", 85)] {
        users.create(user(name, age)).await.unwrap();
    }

    let found = users
        .query()
        .pipe_shared(post_process::search("ada", ["name"]))
        .pipe(|mut users: Vec<User>| {
            users.sort_by_key(|u| u.age);
            users
        })
        .find()
        .await
        .unwrap();

    let ages: Vec<_> = found.iter().map(|u| u.age).collect();
    assert_eq!(ages, [36, 85]);
}

#[tokio::test]
async fn listeners_stop_after_unsubscribe() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&sizes);

    let subscription = users
        .where_greater_or_equal_than("age", 18)
        .find_and_listen(move |found| seen.lock().push(found.len()), |_| {})
        .await
        .unwrap();

    users.create(user("Ada", 36)).await.unwrap();
    users.create(user("Kid", 9)).await.unwrap();
    subscription.unsubscribe();
    users.create(user("Grace", 45)).await.unwrap();

    assert_eq!(*sizes.lock(), vec![0, 1]);
    assert!(!subscription.is_active());
}

#[tokio::test]
async fn watch_streams_result_sets() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();

    let (subscription, mut stream) = users.query().watch().await.unwrap();
    users.create(user("Ada", 36)).await.unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().len(), 0);
    assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);
    subscription.unsubscribe();
}

#[tokio::test]
async fn document_listeners_follow_one_entity() {
    let (mapper, _) = mapper();
    let users = mapper.repository::<User>().unwrap();
    let ada = users.create(user("Ada", 36)).await.unwrap();
    let names = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&names);

    let subscription = users
        .find_by_id_and_listen(
            &ada.id,
            move |found| seen.lock().push(found.map(|u| u.name)),
            |_| {},
        )
        .await
        .unwrap();

    users.update(User { name: "Ada Lovelace".into(), ..ada.clone() }).await.unwrap();
    users.delete(&ada.id).await.unwrap();
    subscription.unsubscribe();

    assert_eq!(
        *names.lock(),
        vec![Some("Ada".to_owned()), Some("Ada Lovelace".to_owned()), None]
    );
}

#[tokio::test]
async fn failed_batches_write_nothing() {
    let (mapper, store) = mapper();
    let batch = mapper.create_batch();
    let users = batch.repository::<User>().unwrap();

    let ada = users.create(user("Ada", 36)).unwrap();
    users.update(&User { id: "missing".into(), ..user("Nobody", 1) }).unwrap();

    assert!(matches!(batch.commit().await, Err(DocumentStoreError::DocumentNotFound(..))));
    assert!(store.get_document(&format!("users/{}", ada.id)).await.unwrap().is_none());
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.status(), BatchStatus::Pending);
}

#[tokio::test]
async fn transactions_commit_staged_writes_and_rebind_accessors() {
    let (mapper, store) = mapper();
    let users = mapper.repository::<User>().unwrap();
    let ada = users.create(user("Ada", 36)).await.unwrap();
    let id = ada.id.clone();

    let updated = mapper
        .run_transaction(|tx| async move {
            let users = tx.repository::<User>()?;
            let mut ada = users.find_by_id(&id).await?.expect("seeded");
            assert!(ada.messages.is_transactional());
            ada.age += 1;
            users.update(ada).await
        })
        .await
        .unwrap();

    assert!(!updated.messages.is_transactional());
    assert_eq!(updated.messages.path(), Some(format!("users/{}/messages", updated.id)));
    let stored = store.get_document(&format!("users/{}", updated.id)).await.unwrap().unwrap();
    assert_eq!(stored.data.get_i32("age").unwrap(), 37);
}

#[tokio::test]
async fn transactions_reject_paging_and_ordering_at_the_call() {
    let (mapper, _) = mapper();

    let outcome: DocumentStoreResult<()> = mapper
        .run_transaction(|tx| async move {
            let users = tx.repository::<User>()?;
            assert!(matches!(
                users.where_equal_to("name", "x").limit(5),
                Err(DocumentStoreError::UnsupportedInTransaction("limit"))
            ));
            assert!(matches!(
                users.query().order_by_descending("age"),
                Err(DocumentStoreError::UnsupportedInTransaction("orderByDescending"))
            ));
            Ok(())
        })
        .await;

    assert!(outcome.is_ok());
}

#[tokio::test]
async fn conflicting_transactions_abort() {
    let (mapper, store) = mapper();
    let users = mapper.repository::<User>().unwrap();
    let ada = users.create(user("Ada", 36)).await.unwrap();
    let path = format!("users/{}", ada.id);
    let outside = store.clone();

    let result = users
        .run_transaction(|users| async move {
            let mut ada = users.find_by_id(&ada.id).await?.expect("seeded");
            outside
                .set_document(
                    &path,
                    bson::doc! { "id": ada.id.clone(), "name": "Changed", "age": 1 },
                    SetOptions::default(),
                )
                .await?;
            ada.age = 99;
            users.update(ada).await
        })
        .await;

    assert!(matches!(result, Err(DocumentStoreError::TransactionAborted(_))));
    let stored = users.find_one().await.unwrap().unwrap();
    assert_eq!(stored.name, "Changed");
}

#[derive(Debug)]
struct UserDirectory {
    users: Repository<User>,
}

impl UserDirectory {
    async fn adults(&self) -> DocumentStoreResult<Vec<User>> {
        self.users.where_greater_or_equal_than("age", 18).find().await
    }
}

impl CustomRepository<User> for UserDirectory {
    fn from_repository(users: Repository<User>) -> Self {
        UserDirectory { users }
    }
}

#[tokio::test]
async fn custom_repositories_wrap_the_base_repository() {
    let (mapper, _) = mapper();
    mapper.register_repository::<User, UserDirectory>().unwrap();
    mapper.repository::<User>().unwrap().create(user("Ada", 36)).await.unwrap();

    let directory = mapper
        .custom_repository::<User, UserDirectory>(CollectionTarget::of::<User>())
        .unwrap();

    assert_eq!(directory.adults().await.unwrap().len(), 1);
}
