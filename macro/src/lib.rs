//! Proc-macros for the conferencing control plane.
//!
//! This crate is intended for inner use only, by the `confcore` server
//! and `confcore-client` crates.

#![forbid(non_ascii_idents, unsafe_code)]

mod dispatchable;

use proc_macro::TokenStream;

/// Generates a `{Enum}Handler` trait (one method per variant, named
/// `on_<snake_case_variant>`) and a `dispatch_with` inherent method on the
/// annotated enum that calls the matching handler method.
///
/// `Command` and `Event` use this so `SessionCoordinator` and
/// `ClientEngine` implement one method per protocol message instead of a
/// hand-written `match` over the `type` discriminator (§9 "Dynamic
/// typing / message dispatch": replace string dispatch with a decoded
/// tagged-variant enum).
///
/// # Example
///
/// ```
/// use confcore_macro::dispatchable;
///
/// #[dispatchable]
/// enum Greeting {
///     Hello { name: String },
///     Bye,
/// }
///
/// struct Printer;
/// impl GreetingHandler for Printer {
///     fn on_hello(&mut self, name: String) {
///         println!("hello, {}", name);
///     }
///     fn on_bye(&mut self) {
///         println!("bye");
///     }
/// }
///
/// Greeting::Hello { name: "Alice".into() }.dispatch_with(&mut Printer);
/// ```
#[proc_macro_attribute]
pub fn dispatchable(_args: TokenStream, input: TokenStream) -> TokenStream {
    match dispatchable::derive(input) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}
