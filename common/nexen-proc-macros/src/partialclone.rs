use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DataStruct, DeriveInput, Field, Fields, parse_quote};

enum FieldBehavior {
    Clone,
    Partial,
    Default,
}

fn parse_field_behavior(field: &Field) -> FieldBehavior {
    let Some(attr) = field.attrs.iter().find(|attr| attr.path().is_ident("partial_clone")) else {
        return FieldBehavior::Clone;
    };

    let mut behavior = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("partial") {
            behavior = Some(FieldBehavior::Partial);
            Ok(())
        } else if meta.path.is_ident("default") {
            behavior = Some(FieldBehavior::Default);
            Ok(())
        } else {
            Err(meta.error("nested partial_clone attribute must be 'partial' or 'default'"))
        }
    })
    .expect("partial_clone attribute must contain 'partial' or 'default'");

    behavior.expect("partial_clone attribute must contain 'partial' or 'default'")
}

fn field_constructor(field: &Field, access: proc_macro2::TokenStream) -> proc_macro2::TokenStream {
    match parse_field_behavior(field) {
        FieldBehavior::Clone => quote! { ::std::clone::Clone::clone(#access) },
        FieldBehavior::Partial => {
            quote! { ::nexen_common::frontend::PartialClone::partial_clone(#access) }
        }
        FieldBehavior::Default => quote! { ::std::default::Default::default() },
    }
}

pub fn partial_clone(input: TokenStream) -> TokenStream {
    let input: DeriveInput = syn::parse(input).expect("unable to parse input");

    let type_ident = &input.ident;
    let body = match &input.data {
        Data::Struct(data) => struct_body(data),
        Data::Enum(data) => enum_body(data),
        Data::Union(_) => panic!("PartialClone does not support unions; {type_ident} is a union"),
    };

    let mut generics = input.generics.clone();
    for type_param in generics.type_params_mut() {
        type_param.bounds.push(parse_quote!(::nexen_common::frontend::PartialClone));
    }
    let (impl_generics, type_generics, where_clause) = generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::nexen_common::frontend::PartialClone for #type_ident #type_generics #where_clause {
            fn partial_clone(&self) -> Self {
                #body
            }
        }
    };

    expanded.into()
}

fn struct_body(data: &DataStruct) -> proc_macro2::TokenStream {
    match &data.fields {
        Fields::Unit => quote! { Self },
        Fields::Unnamed(fields) => {
            let constructors = fields.unnamed.iter().enumerate().map(|(i, field)| {
                let i = syn::Index::from(i);
                field_constructor(field, quote! { &self.#i })
            });

            quote! { Self(#(#constructors,)*) }
        }
        Fields::Named(fields) => {
            let constructors = fields.named.iter().map(|field| {
                let ident = field.ident.as_ref().expect("named fields have idents");
                let constructor = field_constructor(field, quote! { &self.#ident });
                quote! { #ident: #constructor }
            });

            quote! { Self { #(#constructors,)* } }
        }
    }
}

fn enum_body(data: &DataEnum) -> proc_macro2::TokenStream {
    let match_arms: Vec<_> = data
        .variants
        .iter()
        .map(|variant| {
            let variant_ident = &variant.ident;
            match &variant.fields {
                Fields::Unit => quote! { Self::#variant_ident => Self::#variant_ident },
                Fields::Unnamed(fields) => {
                    let (bindings, constructors): (Vec<_>, Vec<_>) = fields
                        .unnamed
                        .iter()
                        .enumerate()
                        .map(|(i, field)| {
                            if matches!(parse_field_behavior(field), FieldBehavior::Default) {
                                (
                                    quote! { _ },
                                    quote! { ::std::default::Default::default() },
                                )
                            } else {
                                let binding = format_ident!("f{i}");
                                let constructor = field_constructor(field, quote! { #binding });
                                (quote! { #binding }, constructor)
                            }
                        })
                        .unzip();

                    quote! {
                        Self::#variant_ident(#(#bindings,)*) => Self::#variant_ident(#(#constructors,)*)
                    }
                }
                Fields::Named(fields) => {
                    let (bindings, constructors): (Vec<_>, Vec<_>) = fields
                        .named
                        .iter()
                        .map(|field| {
                            let ident = field.ident.as_ref().expect("named fields have idents");
                            if matches!(parse_field_behavior(field), FieldBehavior::Default) {
                                (
                                    quote! { #ident: _ },
                                    quote! { #ident: ::std::default::Default::default() },
                                )
                            } else {
                                let constructor = field_constructor(field, quote! { #ident });
                                (quote! { #ident }, quote! { #ident: #constructor })
                            }
                        })
                        .unzip();

                    quote! {
                        Self::#variant_ident { #(#bindings,)* } => Self::#variant_ident { #(#constructors,)* }
                    }
                }
            }
        })
        .collect();

    quote! {
        match self {
            #(#match_arms,)*
        }
    }
}
