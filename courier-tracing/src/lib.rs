#![warn(clippy::pedantic)]

extern crate proc_macro;

use proc_macro2::{Span, TokenStream};
use quote::{ToTokens, quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
    Unspecified,
}

impl Precision {
    /// A closure expression turning the elapsed `Duration` into a readable suffix.
    fn formatter(self) -> syn::Expr {
        match self {
            Self::Nanos => {
                parse_quote!(|d: std::time::Duration| format!("{} ns elapsed", d.as_nanos()))
            }
            Self::Micros => {
                parse_quote!(|d: std::time::Duration| format!("{} us elapsed", d.as_micros()))
            }
            Self::Millis => {
                parse_quote!(|d: std::time::Duration| format!("{} ms elapsed", d.as_millis()))
            }
            Self::Seconds => {
                parse_quote!(|d: std::time::Duration| format!("{} s elapsed", d.as_secs()))
            }
            Self::Unspecified => parse_quote!(|_: std::time::Duration| String::default()),
        }
    }
}

impl From<&str> for Precision {
    fn from(value: &str) -> Self {
        match value {
            "ns" | "nano" | "nanos" | "nanoseconds" => Self::Nanos,
            "us" | "micro" | "micros" | "microseconds" => Self::Micros,
            "ms" | "milli" | "millis" | "milliseconds" => Self::Millis,
            "s" | "sec" | "secs" | "seconds" => Self::Seconds,
            _ => Self::Unspecified,
        }
    }
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if input.peek(syn::token::Paren) {
            let content;
            let _ = syn::parenthesized!(content in input);
            let _ = content.parse::<keywords::precision>()?;
            let _ = content.parse::<syn::Token![=]>()?;
            let precision = content.parse::<syn::LitStr>()?.value();

            Ok(Self::from(precision.as_str()))
        } else {
            Ok(Self::default())
        }
    }
}

/// Level of the enter/exit events, `trace` unless overridden.
#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum EventLevel {
    #[default]
    Trace,
    Debug,
    Info,
}

impl EventLevel {
    fn path(self) -> syn::Path {
        match self {
            Self::Trace => parse_quote!(tracing::Level::TRACE),
            Self::Debug => parse_quote!(tracing::Level::DEBUG),
            Self::Info => parse_quote!(tracing::Level::INFO),
        }
    }
}

impl Parse for EventLevel {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let _ = input.parse::<syn::Token![=]>()?;
        let level = input.parse::<syn::LitStr>()?;

        match level.value().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(syn::Error::new(
                level.span(),
                format!("unsupported level `{other}`, expected one of trace, debug or info"),
            )),
        }
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    level: Option<EventLevel>,
    warnings: Vec<syn::Error>,
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
    syn::custom_keyword!(level);
}

impl Attributes {
    pub(crate) fn warnings(&self) -> impl quote::ToTokens {
        let warnings = self.warnings.iter().map(|err| {
            let msg = format!("found unrecognized input, {err}");
            let msg = syn::LitStr::new(&msg, err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(since = "not actually deprecated", note = #msg)]
                    const TRACED_WARNING: () = ();
                    let _ = TRACED_WARNING;
                }
            }
        });
        quote! {
            { #(#warnings)* }
        }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("expected only a single `timing` argument"));
                }

                let _ = input.parse::<keywords::timing>()?;
                attributes.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("expected only a single `instrument` argument"));
                }

                let _ = input.parse::<keywords::instrument>()?;
                if input.peek(syn::token::Paren) {
                    let content;
                    let _ = syn::parenthesized!(content in input);
                    attributes.instrument = Some(content.parse()?);
                } else {
                    attributes.instrument = Some(TokenStream::new());
                }
            } else if lookahead.peek(keywords::level) {
                if attributes.level.is_some() {
                    return Err(input.error("expected only a single `level` argument"));
                }

                let _ = input.parse::<keywords::level>()?;
                attributes.level = Some(input.parse()?);
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                // Unknown tokens become a warning rather than a hard error
                attributes.warnings.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>();
            }
        }

        Ok(attributes)
    }
}

/// Emits `OnEnter`/`OnExit` events around the attributed function.
///
/// Accepted arguments:
///
/// - `instrument(...)` forwards its contents to `tracing::instrument`
/// - `timing(precision = "ms")` appends the elapsed time to the exit event
/// - `level = "debug"` raises the enter/exit events from `trace`
///
/// The expansion refers to `tracing::...`, so the calling crate has to
/// depend on `tracing` directly.
///
/// # Panics
///
/// When applied to anything other than a function.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let warnings = args.warnings();

    let mut item_fn = parse_macro_input!(item as ItemFn);

    let clippy_attr: syn::Attribute = parse_quote! {
        #[allow(clippy::items_after_statements)]
    };
    item_fn.attrs.push(clippy_attr);

    if let Some(fields) = &args.instrument {
        let fields = fields.to_token_stream();
        let instrument_attr: syn::Attribute = parse_quote! {
            #[tracing::instrument(#fields)]
        };
        item_fn.attrs.push(instrument_attr);
    }

    let level = args.level.unwrap_or_default().path();
    let id = syn::LitStr::new(&item_fn.sig.ident.to_string(), Span::call_site());
    let timing: Stmt = match args.timing {
        None => parse_quote! { tracing::event!(#level, "OnExit: {}", #id); },
        Some(precision) => {
            let formatter = precision.formatter();
            parse_quote! {
                tracing::event!(#level, "OnExit: {} ({})", #id, (#formatter)(self.timer.elapsed()));
            }
        }
    };

    let decl: Vec<Stmt> = parse_quote! {
        struct __Traced {
            timer: std::time::Instant,
        }

        impl __Traced {
            fn new() -> Self {
                #warnings

                tracing::event!(#level, "OnEnter: {}", #id);
                __Traced {
                    timer: std::time::Instant::now(),
                }
            }
        }

        impl std::ops::Drop for __Traced {
            fn drop(&mut self) {
                #timing
            }
        }
    };

    let init: Stmt = parse_quote! { let __traced = __Traced::new(); };
    item_fn.block.stmts.insert(0, init);
    decl.into_iter()
        .rev()
        .for_each(|s| item_fn.block.stmts.insert(0, s));

    let out = quote! { #item_fn };
    proc_macro::TokenStream::from(out)
}
