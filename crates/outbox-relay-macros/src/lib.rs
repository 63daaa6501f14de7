//! Procedural macros for outbox-relay.
//!
//! # OutboxEvent Derive Macro
//!
//! Implements `OutboxEvent` for domain event enums and structs.
//!
//! ## Usage
//!
//! ```ignore
//! #[derive(Serialize, OutboxEvent)]
//! #[outbox(destination = "orders")]  // default destination for all variants
//! enum OrderEvent {
//!     Placed { order_id: String },
//!     Shipped { order_id: String },
//!     #[outbox(destination = "billing", event_type = "order.invoiced")]  // per-variant override
//!     Invoiced { order_id: String, amount: i64 },
//! }
//! ```
//!
//! `event_type` defaults to the variant name (or the struct name).

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, Variant, parse_macro_input, spanned::Spanned};

/// Derives `OutboxEvent`.
///
/// Use `#[outbox(destination = "...")]` on the type to set the default
/// destination, and optionally on individual variants to override it.
#[proc_macro_derive(OutboxEvent, attributes(outbox))]
pub fn derive_outbox_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_outbox_event_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Values collected from one `#[outbox(...)]` attribute.
#[derive(Default)]
struct OutboxAttr {
    destination: Option<LitStr>,
    event_type: Option<LitStr>,
}

fn derive_outbox_event_impl(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let defaults = parse_outbox_attr(&input.attrs)?;

    let (destination_body, event_type_body) = match &input.data {
        Data::Enum(data) => {
            let mut destination_arms = Vec::new();
            let mut event_type_arms = Vec::new();

            for variant in &data.variants {
                let attr = parse_outbox_attr(&variant.attrs)?;
                let destination = variant_destination(variant, &attr, &defaults)?;
                let event_type = attr
                    .event_type
                    .unwrap_or_else(|| LitStr::new(&variant.ident.to_string(), variant.ident.span()));
                let pattern = variant_pattern(variant);

                destination_arms.push(quote! { #pattern => #destination, });
                event_type_arms.push(quote! { #pattern => #event_type, });
            }

            (
                quote! { match self { #(#destination_arms)* } },
                quote! { match self { #(#event_type_arms)* } },
            )
        }
        Data::Struct(_) => {
            let Some(destination) = defaults.destination else {
                return Err(syn::Error::new(
                    input.span(),
                    "OutboxEvent on a struct requires #[outbox(destination = \"...\")]",
                ));
            };
            let event_type = defaults
                .event_type
                .unwrap_or_else(|| LitStr::new(&name.to_string(), name.span()));

            (quote! { #destination }, quote! { #event_type })
        }
        Data::Union(_) => {
            return Err(syn::Error::new(
                input.span(),
                "OutboxEvent can only be derived for enums and structs",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::outbox_relay::OutboxEvent for #name #ty_generics #where_clause {
            fn destination(&self) -> &str {
                #destination_body
            }

            fn event_type(&self) -> &str {
                #event_type_body
            }
        }
    })
}

/// Parse the first `#[outbox(destination = "...", event_type = "...")]` attribute.
fn parse_outbox_attr(attrs: &[Attribute]) -> syn::Result<OutboxAttr> {
    let mut parsed = OutboxAttr::default();

    for attr in attrs {
        if !attr.path().is_ident("outbox") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("destination") {
                parsed.destination = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("event_type") {
                parsed.event_type = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `destination` or `event_type`"))
            }
        })?;
        break;
    }

    Ok(parsed)
}

/// The destination for a variant (variant-level override or enum default).
fn variant_destination(
    variant: &Variant,
    attr: &OutboxAttr,
    defaults: &OutboxAttr,
) -> syn::Result<LitStr> {
    if let Some(destination) = attr.destination.as_ref().or(defaults.destination.as_ref()) {
        return Ok(destination.clone());
    }

    Err(syn::Error::new(
        variant.span(),
        format!(
            "Variant `{}` has no #[outbox(destination = \"...\")] attribute and no default is set. \
             Either add one to this variant or add a default on the enum.",
            variant.ident
        ),
    ))
}

/// A pattern matching the variant while ignoring its fields.
fn variant_pattern(variant: &Variant) -> proc_macro2::TokenStream {
    let ident = &variant.ident;

    match &variant.fields {
        Fields::Named(_) => quote! { Self::#ident { .. } },
        Fields::Unnamed(_) => quote! { Self::#ident(..) },
        Fields::Unit => quote! { Self::#ident },
    }
}
