use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one and inject dependencies.
///
/// Every test gets a fresh in-memory store behind a fresh Rocket instance.
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// `crate::store::MemoryStore`, and `crate::testing::Login`. The last needs
/// a role: `#[backend_test(student)]` puts a student on a new class roster
/// and signs them in, `#[backend_test(admin)]` signs in an admin.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);
    let role = parse_macro_input!(args as Option<Ident>);

    // Extract type information and reject invalid function signatures.
    let (test_args, wants_login) = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Sign in as admin/student if needed.
    let login = match role {
        Some(role) if role == "admin" => quote! {
            #[allow(unused_variables)]
            let login = crate::testing::login_admin(&rocket_client, &store).await;
        },
        Some(role) if role == "student" => quote! {
            #[allow(unused_variables)]
            let login = crate::testing::login_student(&rocket_client, &store).await;
        },
        Some(role) => {
            return syn::Error::new(role.span(), "Expected `admin` or `student`")
                .into_compile_error()
                .into();
        }
        None if wants_login => {
            return syn::Error::new(
                item_fn.sig.span(),
                "Injecting `Login` needs a role: `#[backend_test(admin)]` or `#[backend_test(student)]`",
            )
            .into_compile_error()
            .into();
        }
        None => quote! {},
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// The test itself.
            #item_fn

            log4rs_test_utils::test_logging::init_logging_once_for(
                ["class_rep_backend"],
                None,
                None,
            );

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                // Test setup.
                let store = crate::store::MemoryStore::new();
                let server = crate::rocket_for_store(
                    crate::testing::figment(),
                    std::sync::Arc::new(store.clone()),
                    std::sync::Arc::new(crate::notify::LogNotifier),
                );
                let rocket_client = rocket::local::asynchronous::Client::tracked(server)
                    .await
                    .unwrap();

                #login
                #new_name(#(#test_args),*).await;
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<(Vec<TokenStream2>, bool), syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut args = vec![];
    let mut seen = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(type_ident) = type_path.path.segments.last().map(|s| &s.ident) {
                    let injected = if type_ident == "Client" {
                        Some(quote! { rocket_client })
                    } else if type_ident == "MemoryStore" {
                        Some(quote! { store.clone() })
                    } else if type_ident == "Login" {
                        Some(quote! { login })
                    } else {
                        None
                    };
                    if let Some(injected) = injected {
                        let type_name = type_ident.to_string();
                        if seen.contains(&type_name) {
                            return Err(syn::Error::new(
                                input.span(),
                                format!("Test cannot accept more than one `{type_name}`"),
                            ));
                        }
                        seen.push(type_name);
                        args.push(injected);
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client`, `store_ident: MemoryStore` or `login_ident: Login`",
        ));
    }

    let wants_login = seen.iter().any(|name| name == "Login");
    Ok((args, wants_login))
}
