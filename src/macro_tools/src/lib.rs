extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derive `apply_from` / `apply_to` between a reduced in-memory struct and
/// the full on-disk row named by `#[ApplyMemTo(Target)]`. Every field of the
/// deriving struct must exist on the target with the same name and type.
#[proc_macro_derive(ApplyMem, attributes(ApplyMemTo))]
pub fn apply_mem_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    let name = &ast.ident;
    let target = ast
        .attrs
        .iter()
        .find(|attr| attr.path.is_ident("ApplyMemTo"))
        .and_then(|attr| attr.parse_args::<syn::Ident>().ok())
        .expect("ApplyMem needs #[ApplyMemTo(Target)]");
    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => named
                .named
                .iter()
                .map(|f| f.ident.clone().unwrap())
                .collect::<Vec<_>>(),
            _ => panic!("ApplyMem supports named fields only"),
        },
        _ => panic!("ApplyMem supports structs only"),
    };
    let gen = quote! {
        impl #name {
            /// Load shared fields from the full on-disk row.
            pub fn apply_from(&mut self, other: &#target) {
                #( self.#fields = other.#fields; )*
            }

            /// Store shared fields back onto the full on-disk row.
            pub fn apply_to(&self, other: &mut #target) {
                #( other.#fields = self.#fields; )*
            }
        }
    };
    gen.into()
}
