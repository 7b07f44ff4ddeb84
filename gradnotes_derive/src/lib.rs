//! # Derive Layer and Forward
//! [`Layer`] can be derived for a struct composed of other layers and parameters.\
//! [`Forward`] can be derived for sequential networks, chaining the layers in declaration order.
//!
//! Fields are tagged with `#[gradnotes(..)]`:
//! - `layer`: a child layer.
//! - `parameter`: a `ParameterD`.
//! - `optional_parameter`: an `Option<ParameterD>`.
//!
//! Untagged fields are ignored. Within gradnotes itself, `#[gradnotes(crate)]` on the struct
//! replaces `::gradnotes` with `crate`.
//!```ignore
//! use gradnotes::learn::neural_network::layer::{Conv, Dense, Flatten, Forward, Layer, MaxPool, Relu};
//!
//! #[derive(Layer, Forward)]
//! struct Lenet5 {
//!     #[gradnotes(layer)]
//!     conv1: Conv,
//!     #[gradnotes(layer)]
//!     relu1: Relu,
//!     #[gradnotes(layer)]
//!     pool1: MaxPool,
//!     #[gradnotes(layer)]
//!     flatten: Flatten,
//!     #[gradnotes(layer)]
//!     dense1: Dense,
//! }
//!```
//! Generates:
//!```ignore
//! impl Layer for Lenet5 {
//!     fn parameters_len(&self) -> usize {
//!         0 + Layer::parameters_len(&self.conv1) + Layer::parameters_len(&self.relu1) + ..
//!     }
//!     fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
//!         Layer::collect_parameters(&self.conv1, parameters);
//!         ..
//!     }
//!     fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
//!         Layer::collect_parameters_mut(&mut self.conv1, parameters);
//!         ..
//!     }
//!     fn set_training(&mut self, training: bool) -> Result<()> {
//!         Layer::set_training(&mut self.conv1, training)?;
//!         ..
//!         Ok(())
//!     }
//! }
//!
//! impl Forward for Lenet5 {
//!     fn forward(&self, input: VariableD) -> Result<VariableD> {
//!         let output = input;
//!         let output = Forward::forward(&self.conv1, output)?;
//!         let output = Forward::forward(&self.relu1, output)?;
//!         ..
//!         Ok(output)
//!     }
//! }
//!```

use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Error, Fields, Index,
    Member, Result,
};

#[derive(Clone, Copy, Eq, PartialEq)]
enum FieldKind {
    Layer,
    Parameter,
    OptionalParameter,
}

fn gradnotes_args(attributes: &[Attribute]) -> Vec<String> {
    attributes
        .iter()
        .filter(|attribute| attribute.path.is_ident("gradnotes"))
        .flat_map(|attribute| {
            let tokens = attribute.tokens.to_string();
            tokens
                .trim()
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .map(|arg| arg.trim().to_string())
                .filter(|arg| !arg.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn crate_path(input: &DeriveInput) -> TokenStream {
    if gradnotes_args(&input.attrs).iter().any(|arg| arg == "crate") {
        quote! { crate }
    } else {
        quote! { ::gradnotes }
    }
}

fn field_kind(attributes: &[Attribute]) -> Result<Option<FieldKind>> {
    let mut kind = None;
    for arg in gradnotes_args(attributes) {
        let next = match arg.as_str() {
            "layer" => FieldKind::Layer,
            "parameter" => FieldKind::Parameter,
            "optional_parameter" => FieldKind::OptionalParameter,
            "skip" => continue,
            _ => {
                let span = attributes
                    .first()
                    .map(|attribute| attribute.span())
                    .unwrap_or_else(proc_macro2::Span::call_site);
                return Err(Error::new(
                    span,
                    format!("unknown gradnotes attribute `{arg}`, expected `layer`, `parameter` or `optional_parameter`"),
                ));
            }
        };
        if kind.replace(next).is_some() {
            return Err(Error::new(
                attributes[0].span(),
                "a field can only have one gradnotes attribute",
            ));
        }
    }
    Ok(kind)
}

fn tagged_fields(input: &DeriveInput) -> Result<Vec<(Member, FieldKind)>> {
    let fields = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => Some(&fields.named),
            Fields::Unnamed(fields) => Some(&fields.unnamed),
            Fields::Unit => None,
        },
        _ => {
            return Err(Error::new(
                input.ident.span(),
                "gradnotes derives only support structs",
            ))
        }
    };
    let mut tagged = Vec::new();
    if let Some(fields) = fields {
        for (i, field) in fields.iter().enumerate() {
            if let Some(kind) = field_kind(&field.attrs)? {
                let member = match &field.ident {
                    Some(ident) => Member::Named(ident.clone()),
                    None => Member::Unnamed(Index::from(i)),
                };
                tagged.push((member, kind));
            }
        }
    }
    Ok(tagged)
}

fn layer_impl(input: &DeriveInput) -> Result<TokenStream> {
    let krate = crate_path(input);
    let layer = quote! { #krate::learn::neural_network::layer::Layer };
    let parameter = quote! { #krate::learn::neural_network::autograd::ParameterD };
    let fields = tagged_fields(input)?;
    let mut lens = TokenStream::new();
    let mut collects = TokenStream::new();
    let mut collects_mut = TokenStream::new();
    let mut set_trainings = TokenStream::new();
    for (member, kind) in fields.iter() {
        match kind {
            FieldKind::Layer => {
                lens.extend(quote! { + #layer::parameters_len(&self. #member) });
                collects.extend(quote! { #layer::collect_parameters(&self. #member, parameters); });
                collects_mut.extend(
                    quote! { #layer::collect_parameters_mut(&mut self. #member, parameters); },
                );
                set_trainings
                    .extend(quote! { #layer::set_training(&mut self. #member, training)?; });
            }
            FieldKind::Parameter => {
                lens.extend(quote! { + 1 });
                collects.extend(quote! { parameters.push(self. #member .clone()); });
                collects_mut.extend(quote! { parameters.push(&mut self. #member); });
                set_trainings.extend(quote! { self. #member .set_training(training); });
            }
            FieldKind::OptionalParameter => {
                lens.extend(quote! { + self. #member .is_some() as usize });
                collects.extend(quote! {
                    if let Some(parameter) = self. #member .as_ref() {
                        parameters.push(parameter.clone());
                    }
                });
                collects_mut.extend(quote! {
                    if let Some(parameter) = self. #member .as_mut() {
                        parameters.push(parameter);
                    }
                });
                set_trainings.extend(quote! {
                    if let Some(parameter) = self. #member .as_mut() {
                        parameter.set_training(training);
                    }
                });
            }
        }
    }
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    if fields.is_empty() {
        return Ok(quote! {
            impl #impl_generics #layer for #ident #ty_generics #where_clause {}
        });
    }
    Ok(quote! {
        impl #impl_generics #layer for #ident #ty_generics #where_clause {
            fn parameters_len(&self) -> usize {
                0 #lens
            }
            fn collect_parameters(&self, parameters: &mut ::std::vec::Vec<#parameter>) {
                #collects
            }
            fn collect_parameters_mut<'__a>(
                &'__a mut self,
                parameters: &mut ::std::vec::Vec<&'__a mut #parameter>,
            ) {
                #collects_mut
            }
            fn set_training(&mut self, training: bool) -> #krate::result::Result<()> {
                #set_trainings
                Ok(())
            }
        }
    })
}

fn forward_impl(input: &DeriveInput) -> Result<TokenStream> {
    let krate = crate_path(input);
    let forward = quote! { #krate::learn::neural_network::layer::Forward };
    let variable = quote! { #krate::learn::neural_network::autograd::VariableD };
    let forwards: TokenStream = tagged_fields(input)?
        .into_iter()
        .filter(|(_, kind)| *kind == FieldKind::Layer)
        .map(|(member, _)| {
            quote! { let output = #forward::forward(&self. #member, output)?; }
        })
        .collect();
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics #forward for #ident #ty_generics #where_clause {
            fn forward(&self, input: #variable) -> #krate::result::Result<#variable> {
                let output = input;
                #forwards
                Ok(output)
            }
        }
    })
}

/// Derives `Layer`.
///
/// Parameters are enumerated in field declaration order.
#[proc_macro_derive(Layer, attributes(gradnotes))]
pub fn derive_layer(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match layer_impl(&input) {
        Ok(output) => output.into(),
        Err(error) => error.to_compile_error().into_token_stream().into(),
    }
}

/// Derives a sequential `Forward`.
///
/// The input is passed through each `#[gradnotes(layer)]` field in declaration order.
#[proc_macro_derive(Forward, attributes(gradnotes))]
pub fn derive_forward(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match forward_impl(&input) {
        Ok(output) => output.into(),
        Err(error) => error.to_compile_error().into_token_stream().into(),
    }
}
