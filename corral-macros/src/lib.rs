use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Attribute macro for async tests that installs the shared tracing
/// subscriber around the test body.
/// Usage:
/// #[corral::test]
/// async fn my_test() { ... }
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &input.sig.ident;

    let output = quote! {
        #[tokio::test]
        #vis #sig {
            corral::trace::with_test_tracing(stringify!(#name), || async move { #block }).await
        }
    };
    output.into()
}
