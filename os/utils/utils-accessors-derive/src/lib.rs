//! # Accessor Derive
//!
//! Derive macros that generate builder-style setters and by-value getters for
//! plain configuration structs.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `const .with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// - Skipping a field: `#[accessors(skip)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Window {
///     start: u32,
///     #[accessors(skip)]
///     pages: u32,
/// }
///
/// let mut w = Window { start: 0x1000, pages: 1 };
/// w.set_start(0x2000).set_start(0x3000);
/// let w2 = w.with_start(0x8048000);
/// assert_eq!(w2.start, 0x8048000);
/// ```
#[proc_macro_derive(Setters, attributes(accessors))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Setters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let methods = fields
        .iter()
        .filter(|field| !should_skip(&field.attrs))
        .filter_map(|field| {
            let fname = field.ident.as_ref()?;
            let ty = &field.ty;
            let set_name = format_ident!("set_{}", fname);
            let with_name = format_ident!("with_{}", fname);
            Some(quote! {
                #[inline]
                pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                    self.#fname = value;
                    self
                }

                #[inline]
                #[must_use]
                pub const fn #with_name(mut self, value: #ty) -> Self {
                    self.#fname = value;
                    self
                }
            })
        })
        .collect::<Vec<_>>();

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    TokenStream::from(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

/// Derive to generate `const .<field>(&self) -> Ty` for each **named** field.
///
/// Fields must be `Copy`; getters return by value.
///
/// - Skipping a field: `#[accessors(skip)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Getters;
///
/// #[derive(Getters)]
/// struct Pool {
///     start: u32,
///     pages: u32,
/// }
///
/// let p = Pool { start: 0x20_0000, pages: 16 };
/// assert_eq!(p.pages(), 16);
/// ```
#[proc_macro_derive(Getters, attributes(accessors))]
pub fn derive_getters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match named_fields(&input, "Getters") {
        Ok(fields) => fields,
        Err(e) => return e.to_compile_error().into(),
    };

    let methods = fields
        .iter()
        .filter(|field| !should_skip(&field.attrs))
        .filter_map(|field| {
            let fname = field.ident.as_ref()?;
            let ty = &field.ty;
            let docs = field.attrs.iter().filter(|a| a.path().is_ident("doc"));
            Some(quote! {
                #(#docs)*
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            })
        })
        .collect::<Vec<_>>();

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    TokenStream::from(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

fn named_fields<'a>(input: &'a DeriveInput, derive: &str) -> syn::Result<&'a Punctuated<Field, Comma>> {
    match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(n) => Ok(&n.named),
            Fields::Unnamed(u) => Err(syn::Error::new(
                u.span(),
                format!("{derive} only supports named fields"),
            )),
            Fields::Unit => Err(syn::Error::new(
                input.ident.span(),
                format!("{derive} does not apply to unit structs"),
            )),
        },
        _ => Err(syn::Error::new(
            input.ident.span(),
            format!("{derive} can only be derived for structs"),
        )),
    }
}

fn should_skip(attrs: &[syn::Attribute]) -> bool {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident("accessors") {
            continue;
        }

        // Accept #[accessors(skip)] and #[accessors(skip = true)]
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                if meta.input.is_empty() {
                    skip = true;
                } else if let Ok(v) = meta.value()?.parse::<LitBool>()
                    && v.value
                {
                    skip = true;
                }
            }
            Ok(())
        });
    }
    skip
}
