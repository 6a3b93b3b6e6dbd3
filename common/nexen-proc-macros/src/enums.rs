use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

fn parse_fieldless_enum(
    input: TokenStream,
    macro_name: &str,
) -> (DeriveInput, Vec<proc_macro2::Ident>) {
    let ast: DeriveInput = syn::parse(input).expect("unable to parse input");
    let name = ast.ident.clone();

    let Data::Enum(data) = &ast.data else {
        panic!("{macro_name} can only be applied to enums; {name} is not an enum");
    };

    let variants = data
        .variants
        .iter()
        .map(|variant| {
            assert!(
                matches!(variant.fields, Fields::Unit),
                "{macro_name} only supports fieldless variants; {name}::{} has fields",
                variant.ident
            );
            variant.ident.clone()
        })
        .collect();

    (ast, variants)
}

pub fn enum_display(input: TokenStream) -> TokenStream {
    let (ast, variants) = parse_fieldless_enum(input, "EnumDisplay");
    let name = &ast.ident;

    let match_arms = variants.iter().map(|variant| {
        let variant_str = variant.to_string();
        quote! { Self::#variant => #variant_str }
    });

    let expanded = quote! {
        impl #name {
            #[must_use]
            pub fn to_str(&self) -> &'static str {
                match self {
                    #(#match_arms,)*
                }
            }
        }

        impl ::std::fmt::Display for #name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.to_str())
            }
        }
    };

    expanded.into()
}

pub fn enum_from_str(input: TokenStream) -> TokenStream {
    let (ast, variants) = parse_fieldless_enum(input, "EnumFromStr");
    let name = &ast.ident;

    let match_arms = variants.iter().map(|variant| {
        let lowercase = variant.to_string().to_ascii_lowercase();
        quote! { #lowercase => ::std::result::Result::Ok(Self::#variant) }
    });

    let err_fmt_string = format!("invalid {name} string: '{{}}'");
    let expanded = quote! {
        impl ::std::str::FromStr for #name {
            type Err = ::std::string::String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    #(#match_arms,)*
                    _ => ::std::result::Result::Err(::std::format!(#err_fmt_string, s)),
                }
            }
        }
    };

    expanded.into()
}

pub fn enum_all(input: TokenStream) -> TokenStream {
    let (ast, variants) = parse_fieldless_enum(input, "EnumAll");
    let name = &ast.ident;

    let num_variants = variants.len();
    let expanded = quote! {
        impl #name {
            pub const ALL: [Self; #num_variants] = [#(Self::#variants,)*];
        }
    };

    expanded.into()
}

pub fn match_each_variant_macro(input: TokenStream) -> TokenStream {
    let ast: DeriveInput = syn::parse(input).expect("unable to parse input");
    let name = &ast.ident;

    let Data::Enum(data) = &ast.data else {
        panic!("MatchEachVariantMacro can only be applied to enums; {name} is not an enum");
    };

    let variant_idents: Vec<_> = data
        .variants
        .iter()
        .map(|variant| {
            let Fields::Unnamed(fields) = &variant.fields else {
                panic!("{name}::{} should have a single unnamed field", variant.ident);
            };
            assert_eq!(
                fields.unnamed.len(),
                1,
                "{name}::{} has {} unnamed fields, expected 1",
                variant.ident,
                fields.unnamed.len()
            );
            variant.ident.clone()
        })
        .collect();

    let match_arms = variant_idents.iter().map(|variant| {
        quote! { #name::#variant($field) => $match_arm }
    });
    let variant_match_arms = variant_idents.iter().map(|variant| {
        quote! { #name::#variant($field) => #name::#variant($match_arm) }
    });

    let expanded = quote! {
        macro_rules! match_each_variant {
            ($value:expr, $field:ident => $match_arm:expr) => {
                match $value {
                    #(#match_arms,)*
                }
            };
            ($value:expr, $field:ident => :variant($match_arm:expr)) => {
                match $value {
                    #(#variant_match_arms,)*
                }
            };
        }
    };

    expanded.into()
}
