use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields};

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

fn field_reader(field: &syn::Field) -> TokenStream {
    let ty = &field.ty;
    if is_skipped(field) {
        quote! { ::core::default::Default::default() }
    } else {
        quote! { <#ty as ::tempest_proto::Deserializable>::deserialize(ctx, r)? }
    }
}

pub fn derive_deserialize_impl(input: DeriveInput) -> TokenStream {
    let name = &input.ident;
    let name_str = name.to_string();
    let mut generics = input.generics.clone();
    for param in &mut generics.params {
        if let syn::GenericParam::Type(t) = param {
            t.bounds
                .push(syn::parse_quote!(::tempest_proto::Deserializable));
        }
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let body = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(fields) => {
                let inits: Vec<TokenStream> = fields
                    .named
                    .iter()
                    .map(|f| {
                        let ident = f.ident.clone().expect("named field");
                        let read = field_reader(f);
                        quote! { #ident: #read, }
                    })
                    .collect();
                quote! { Ok(#name { #(#inits)* }) }
            }
            Fields::Unnamed(fields) => {
                let reads: Vec<TokenStream> =
                    fields.unnamed.iter().map(field_reader).collect();
                quote! { Ok(#name(#(#reads),*)) }
            }
            Fields::Unit => quote! { Ok(#name) },
        },
        Data::Enum(e) => {
            let arms: Vec<TokenStream> = e
                .variants
                .iter()
                .enumerate()
                .map(|(tag, variant)| {
                    let tag = tag as u8;
                    let vname = &variant.ident;
                    match &variant.fields {
                        Fields::Unit => quote! { #tag => Ok(#name::#vname), },
                        Fields::Unnamed(fields) => {
                            let reads: Vec<TokenStream> =
                                fields.unnamed.iter().map(field_reader).collect();
                            quote! { #tag => Ok(#name::#vname(#(#reads),*)), }
                        }
                        Fields::Named(fields) => {
                            let inits: Vec<TokenStream> = fields
                                .named
                                .iter()
                                .map(|f| {
                                    let ident = f.ident.clone().expect("named field");
                                    let read = field_reader(f);
                                    quote! { #ident: #read, }
                                })
                                .collect();
                            quote! { #tag => Ok(#name::#vname { #(#inits)* }), }
                        }
                    }
                })
                .collect();
            quote! {
                let tag = r.read_u8()?;
                match tag {
                    #(#arms)*
                    other => Err(::tempest_proto::Error::InvalidDiscriminant {
                        type_name: #name_str,
                        value: other,
                    }),
                }
            }
        }
        Data::Union(_) => {
            return quote! {
                compile_error!("#[derive(Tempest)] does not support unions");
            };
        }
    };

    quote! {
        impl #impl_generics ::tempest_proto::Deserializable for #name #ty_generics #where_clause {
            fn deserialize(
                ctx: &mut ::tempest_proto::DeserializationContext,
                r: &mut ::tempest_proto::BufferReader<'_>,
            ) -> ::tempest_proto::Result<Self> {
                #[allow(unused_variables)]
                let (ctx, r) = (ctx, r);
                #body
            }
        }
    }
}
