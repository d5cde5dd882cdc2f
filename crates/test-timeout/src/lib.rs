//! Test attributes that fail a test instead of hanging CI when a signaling
//! exchange never completes.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async one
//! (on a current-thread runtime with timers enabled). Both take an optional
//! limit in seconds; `MEET_TEST_TIMEOUT_SECS` overrides it at run time.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(__limit, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let runner = watchdog(timeout, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #runner
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &["test"]);
    let runner = watchdog(timeout, quote! { let _ = __limit; #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #runner
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `body` on a helper thread and fails the test once `secs` elapse.
/// `body` sees the effective limit as `__limit`.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __limit = std::env::var("MEET_TEST_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
            .unwrap_or(std::time::Duration::from_secs(#secs));
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(__limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", __limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

/// Drops attributes that would double-register the test, matched by path.
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}
