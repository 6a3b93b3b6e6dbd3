mod encode;
mod enums;
mod partialclone;

use proc_macro::TokenStream;

/// Implement `std::fmt::Display` for an enum with only fieldless variants, along with a
/// `to_str(&self) -> &'static str` method for cases where an owned String is not needed.
///
/// # Panics
///
/// Panics if applied to anything other than an enum with only fieldless variants.
#[proc_macro_derive(EnumDisplay)]
pub fn enum_display(input: TokenStream) -> TokenStream {
    enums::enum_display(input)
}

/// Implement a case-insensitive `std::str::FromStr` for an enum with only fieldless variants,
/// with `FromStr::Err = String`.
///
/// # Panics
///
/// Panics if applied to anything other than an enum with only fieldless variants.
#[proc_macro_derive(EnumFromStr)]
pub fn enum_from_str(input: TokenStream) -> TokenStream {
    enums::enum_from_str(input)
}

/// Add an `ALL` constant of type `[Self; N]` containing every variant of a fieldless enum, in
/// declaration order.
///
/// # Panics
///
/// Panics if applied to anything other than an enum with only fieldless variants.
#[proc_macro_derive(EnumAll)]
pub fn enum_all(input: TokenStream) -> TokenStream {
    enums::enum_all(input)
}

/// Implement `bincode::Encode` with a fake implementation that encodes nothing and always
/// returns `Ok(())`.
///
/// Used for fields that hold read-only data (ROMs, frame buffers) that should not be part of
/// serialized state.
///
/// # Panics
///
/// Panics only if the input cannot be parsed.
#[proc_macro_derive(FakeEncode)]
pub fn fake_encode(input: TokenStream) -> TokenStream {
    encode::fake_encode(input)
}

/// Implement `bincode::Decode` and `bincode::BorrowDecode` with fake implementations that decode
/// nothing and return `Ok(Self::default())`.
///
/// The type must have a `default()` associated function, preferably via the `Default` trait.
///
/// # Panics
///
/// Panics only if the input cannot be parsed.
#[proc_macro_derive(FakeDecode)]
pub fn fake_decode(input: TokenStream) -> TokenStream {
    encode::fake_decode(input)
}

/// Implement the `nexen_common::frontend::PartialClone` trait for a struct or enum.
///
/// Fields without a `#[partial_clone]` attribute are cloned via `Clone`. Fields marked
/// `#[partial_clone(default)]` are replaced with their `Default` value, and fields marked
/// `#[partial_clone(partial)]` are cloned via their own `PartialClone` implementation.
///
/// This macro should be imported through `nexen_common` so that the trait is in scope.
///
/// # Panics
///
/// Panics if applied to a union or if a `#[partial_clone]` attribute is malformed.
#[proc_macro_derive(PartialClone, attributes(partial_clone))]
pub fn partial_clone(input: TokenStream) -> TokenStream {
    partialclone::partial_clone(input)
}

/// Generate a declarative macro `match_each_variant!` for an enum in which every variant has
/// exactly one unnamed field. The generated macro expands to a match expression with an
/// identical arm for every variant:
///
/// ```
/// use nexen_proc_macros::MatchEachVariantMacro;
///
/// #[derive(MatchEachVariantMacro)]
/// enum Example {
///     A(u16),
///     B(u32),
/// }
///
/// impl Example {
///     fn value(&self) -> u32 {
///         match_each_variant!(*self, inner => u32::from(inner))
///     }
/// }
/// ```
///
/// The `:variant(...)` form re-wraps the arm expression in the matched variant's constructor.
///
/// # Panics
///
/// Panics if applied to anything other than an enum in which every variant has exactly one
/// unnamed field.
#[proc_macro_derive(MatchEachVariantMacro)]
pub fn match_each_variant_macro(input: TokenStream) -> TokenStream {
    enums::match_each_variant_macro(input)
}
