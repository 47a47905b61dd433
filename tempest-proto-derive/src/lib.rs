//! `#[derive(Tempest)]` generates `Serializable` and `Deserializable`
//! impls for message payload types.
//!
//! Structs serialize field by field in declaration order; enums as a u8
//! discriminant followed by the variant's fields. `#[tempest(skip)]`
//! excludes a field from the wire; it is reconstructed with `Default`.

mod deserialize;
mod serialize;

use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

#[proc_macro_derive(Tempest, attributes(tempest))]
pub fn derive_tempest(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut expanded = serialize::derive_serialize_impl(input.clone());
    expanded.extend(deserialize::derive_deserialize_impl(input));
    expanded = quote! {
        const _: () = {
            #[allow(unused_imports)]
            use ::tempest_proto::{Serializable as _, Deserializable as _};
            #expanded
        };
    };
    TokenStream::from(expanded)
}
