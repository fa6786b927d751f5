//! `#[derive(DeviceCopy)]` for hdmem.
//!
//! The derive emits an `unsafe impl DeviceCopy` plus a hidden function which asserts, at compile
//! time, that every field type is itself `DeviceCopy`. Generic parameters gain a `DeviceCopy`
//! bound.

extern crate proc_macro;

use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::{Ident, Span, TokenStream};
use quote::quote;
use syn::{
    parse_macro_input, parse_quote, Data, DataEnum, DataStruct, DataUnion, DeriveInput, Field,
    Fields, Generics, TypeParamBound,
};

#[proc_macro_derive(DeviceCopy)]
pub fn derive_device_copy(input: BaseTokenStream) -> BaseTokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    BaseTokenStream::from(impl_device_copy(&ast))
}

fn impl_device_copy(input: &DeriveInput) -> TokenStream {
    let input_type = &input.ident;

    let field_checks = match input.data {
        Data::Struct(ref data) => check_struct(data),
        Data::Enum(ref data) => check_enum(data),
        Data::Union(ref data) => check_union(data),
    };

    let verify_ident = Ident::new(
        &format!("__verify_{}_can_implement_DeviceCopy", input_type),
        Span::call_site(),
    );

    let generics = with_device_copy_bounds(&input.generics);
    let (impl_generics, type_generics, where_clause) = generics.split_for_impl();

    quote! {
        unsafe impl #impl_generics ::hdmem::memory::DeviceCopy for #input_type #type_generics #where_clause {}

        #[doc(hidden)]
        #[allow(non_snake_case, dead_code, unused_variables)]
        fn #verify_ident #impl_generics (value: &#input_type #type_generics) #where_clause {
            #field_checks
        }
    }
}

fn with_device_copy_bounds(generics: &Generics) -> Generics {
    let mut generics = generics.clone();
    let bound: TypeParamBound = parse_quote!(::hdmem::memory::DeviceCopy);
    for param in generics.type_params_mut() {
        param.bounds.push(bound.clone());
    }
    generics
}

fn fields_of(fields: &Fields) -> Vec<&Field> {
    match fields {
        Fields::Named(named) => named.named.iter().collect(),
        Fields::Unnamed(unnamed) => unnamed.unnamed.iter().collect(),
        Fields::Unit => vec![],
    }
}

fn check_struct(data: &DataStruct) -> TokenStream {
    check_fields(&fields_of(&data.fields))
}

fn check_enum(data: &DataEnum) -> TokenStream {
    let fields: Vec<&Field> = data
        .variants
        .iter()
        .flat_map(|variant| fields_of(&variant.fields))
        .collect();
    check_fields(&fields)
}

fn check_union(data: &DataUnion) -> TokenStream {
    let fields: Vec<&Field> = data.fields.named.iter().collect();
    check_fields(&fields)
}

fn check_fields(fields: &[&Field]) -> TokenStream {
    let checks = fields.iter().map(|field| {
        let field_type = &field.ty;
        quote! {
            {
                fn assert_impl<T: ::hdmem::memory::DeviceCopy + ?Sized>() {}
                assert_impl::<#field_type>();
            }
        }
    });
    quote!(#(#checks)*)
}
