use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Run a test on its own thread and fail it if it does not finish in time.
///
/// Works on plain and `async` test functions. Async bodies run on a Tokio
/// current-thread runtime unless `multi_thread` is given.
///
/// ```ignore
/// #[test_timeout::timeout]
/// fn quick() {}
///
/// #[test_timeout::timeout(secs = 5, multi_thread)]
/// async fn talks_to_a_server() {}
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;
    let mut multi_thread = false;
    let options = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            timeout_secs = lit.base10_parse()?;
            if timeout_secs == 0 {
                return Err(meta.error("timeout must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("multi_thread") {
            multi_thread = true;
            Ok(())
        } else {
            Err(meta.error("expected `secs = <n>` or `multi_thread`"))
        }
    });
    parse_macro_input!(attr with options);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = timeout_secs;
    let body = if sig.asyncness.take().is_some() {
        let runtime = if multi_thread {
            quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
        } else {
            quote! { tokio::runtime::Builder::new_current_thread() }
        };
        quote! {
            || {
                let runtime = #runtime
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            }
        }
    } else {
        quote! { || #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(#body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
