use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Index};

fn is_skipped(field: &syn::Field) -> bool {
    let mut skip = false;
    for attr in &field.attrs {
        if attr.path().is_ident("tempest") {
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                }
                Ok(())
            });
        }
    }
    skip
}

pub fn derive_serialize_impl(input: DeriveInput) -> TokenStream {
    let name = &input.ident;
    let mut generics = input.generics.clone();
    for param in &mut generics.params {
        if let syn::GenericParam::Type(t) = param {
            t.bounds.push(syn::parse_quote!(::tempest_proto::Serializable));
        }
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(s) => {
            let writes: Vec<TokenStream> = s
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| !is_skipped(f))
                .map(|(i, f)| {
                    let accessor = match &f.ident {
                        Some(ident) => quote!(self.#ident),
                        None => {
                            let index = Index::from(i);
                            quote!(self.#index)
                        }
                    };
                    quote! { #accessor.serialize(ctx, w)?; }
                })
                .collect();
            quote! {
                #(#writes)*
                Ok(())
            }
        }
        Data::Enum(e) => {
            let arms: Vec<TokenStream> = e
                .variants
                .iter()
                .enumerate()
                .map(|(tag, variant)| {
                    let tag = tag as u8;
                    let vname = &variant.ident;
                    match &variant.fields {
                        Fields::Unit => quote! {
                            #name::#vname => {
                                w.write_u8(#tag);
                            }
                        },
                        Fields::Unnamed(fields) => {
                            let bindings: Vec<_> = (0..fields.unnamed.len())
                                .map(|i| format_ident!("f{}", i))
                                .collect();
                            quote! {
                                #name::#vname(#(#bindings),*) => {
                                    w.write_u8(#tag);
                                    #(#bindings.serialize(ctx, w)?;)*
                                }
                            }
                        }
                        Fields::Named(fields) => {
                            let bindings: Vec<_> = fields
                                .named
                                .iter()
                                .map(|f| f.ident.clone().expect("named field"))
                                .collect();
                            quote! {
                                #name::#vname { #(#bindings),* } => {
                                    w.write_u8(#tag);
                                    #(#bindings.serialize(ctx, w)?;)*
                                }
                            }
                        }
                    }
                })
                .collect();
            quote! {
                match self {
                    #(#arms)*
                }
                Ok(())
            }
        }
        Data::Union(_) => {
            return quote! {
                compile_error!("#[derive(Tempest)] does not support unions");
            };
        }
    };

    quote! {
        impl #impl_generics ::tempest_proto::Serializable for #name #ty_generics #where_clause {
            fn serialize(
                &self,
                ctx: &mut ::tempest_proto::SerializationContext,
                w: &mut ::tempest_proto::BufferWriter,
            ) -> ::tempest_proto::Result<()> {
                #[allow(unused_variables)]
                let (ctx, w) = (ctx, w);
                #body
            }
        }
    }
}
