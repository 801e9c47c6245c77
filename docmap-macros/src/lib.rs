//! Procedural macros for the docmap project.
//!
//! This crate provides `#[derive(Entity)]`, which implements `docmap::entity::Entity`
//! for a struct with named fields:
//!
//! - The identifier is the field named `id`, or the field marked `#[entity(id)]`. It must
//!   be a `String`.
//! - `#[entity(name = "...")]` on the struct overrides the name used to derive default
//!   collection names.
//! - Every field whose type is `SubCollection<_>` becomes a sub-collection accessor keyed
//!   by the field name.

#[allow(unused_extern_crates)]
extern crate self as docmap_macros;

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Data, DeriveInput, Field, Fields, Ident, LitStr, Type, parse_macro_input, spanned::Spanned,
};

#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct StructOptions {
    name: Option<LitStr>,
}

fn struct_options(input: &DeriveInput) -> syn::Result<StructOptions> {
    let mut options = StructOptions::default();

    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                options.name = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `name = \"...\"`"))
            }
        })?;
    }

    Ok(options)
}

fn is_marked_id(field: &Field) -> syn::Result<bool> {
    let mut marked = false;

    for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                marked = true;
                Ok(())
            } else {
                Err(meta.error("expected `id`"))
            }
        })?;
    }

    Ok(marked)
}

fn is_sub_collection(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "SubCollection"),
        _ => false,
    }
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.span(), "Entity can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(input.span(), "Entity requires named fields"));
    };

    let mut id_field: Option<&Ident> = None;
    for field in &fields.named {
        if is_marked_id(field)? {
            if id_field.is_some() {
                return Err(syn::Error::new(field.span(), "only one field can be marked #[entity(id)]"));
            }
            id_field = field.ident.as_ref();
        }
    }
    let id_field = match id_field {
        Some(ident) => ident,
        None => fields
            .named
            .iter()
            .filter_map(|field| field.ident.as_ref())
            .find(|ident| *ident == "id")
            .ok_or_else(|| {
                syn::Error::new(input.ident.span(), "no `id` field; mark one with #[entity(id)]")
            })?,
    };

    let id_key = id_field.to_string();
    let id_const = (id_key != "id").then(|| quote! { const ID_FIELD: &'static str = #id_key; });

    let name_fn = struct_options(&input)?.name.map(|name| {
        quote! {
            fn entity_name() -> &'static str {
                #name
            }
        }
    });

    let accessors: Vec<_> = fields
        .named
        .iter()
        .filter(|field| is_sub_collection(&field.ty))
        .filter_map(|field| field.ident.as_ref())
        .map(|ident| {
            let key = ident.to_string();
            quote! { #key => ::core::option::Option::Some(self.#ident.slot()), }
        })
        .collect();

    let sub_collection_fn = (!accessors.is_empty()).then(|| {
        quote! {
            fn sub_collection(
                &self,
                accessor_key: &str,
            ) -> ::core::option::Option<&::docmap::entity::AccessorSlot> {
                match accessor_key {
                    #(#accessors)*
                    _ => ::core::option::Option::None,
                }
            }
        }
    });

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::docmap::entity::Entity for #ident #ty_generics #where_clause {
            #id_const

            fn id(&self) -> &str {
                &self.#id_field
            }

            fn set_id(&mut self, id: ::std::string::String) {
                self.#id_field = id;
            }

            #name_fn

            #sub_collection_fn
        }
    })
}
