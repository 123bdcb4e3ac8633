//! `procpool-errors` provides the [`error!`] macro, a small DSL that every
//! other `procpool` crate uses to declare its own `Error` enum.
//!
//! An `Error` declared with [`error!`] implements [`std::error::Error`] (via
//! [`thiserror`]) and [`miette::Diagnostic`] in one go, and renders a
//! human-readable message plus an optional help string for whoever is staring
//! at a worker that just died.
//!
//! ```rust
//! use procpool_errors::error;
//!
//! error! {
//!     pub enum Error {
//!         #[code = E200]
//!         #[message = "the thing broke"]
//!         #[formatted_message("the thing broke: {0}")]
//!         #[help = "try turning it off and on again"]
//!         Broke(String),
//!     }
//! }
//!
//! # fn main() {
//! let error = Error::Broke("reason".to_string());
//! assert_eq!(error.to_string(), "the thing broke: reason".to_string());
//! # }
//! ```

#![deny(unused)]
#![deny(warnings)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

pub use miette::Result;

#[doc(hidden)]
#[macro_export]
macro_rules! as_item {
    ($item:item) => {
        $item
    };
}

/// Declare an `Error` enum that implements [`thiserror::Error`] and
/// [`miette::Diagnostic`].
///
/// Each variant takes:
///
/// * `#[cfg(…)]` (optional),
/// * `#[code = E...]` (optional), an error code shown in diagnostics,
/// * `#[message = "…"]`, a literal message, used as the variant's
///   documentation,
/// * `#[formatted_message("… {0} …")]` (optional), a [`thiserror`]-style
///   format string used for [`std::fmt::Display`]; defaults to `#[message]`
///   when absent,
/// * `#[help = "…"]`, a hint nudging the reader toward a fix.
///
/// A variant may instead be marked `#[transparent]`, forwarding everything to
/// its single tuple field (typically used with `#[from]`).
#[macro_export]
macro_rules! error {
    // Variant with a dynamic, formatted message.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $( #[cfg( $cfg:meta )] )*
        $( #[code = $error_code:ident] )?
        #[message = $error_message:expr]
        #[formatted_message( $error_message_format:literal $( , . $error_message_arguments:expr )* $( , )* )]
        #[help = $error_help:literal]
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*

                #[doc = $error_message]
                #[error( $error_message_format $( , . $error_message_arguments ),* )]
                #[diagnostic(
                    $( code($error_code), )?
                    help($error_help),
                )]
                $( #[cfg( $cfg )] )*
            ]
            $( $tail )*
        }
    };

    // Variant with a literal message only.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $( #[cfg( $cfg:meta )] )*
        $( #[code = $error_code:ident] )?
        #[message = $error_message:expr]
        #[help = $error_help:literal]
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*

                #[doc = $error_message]
                #[error($error_message)]
                #[diagnostic(
                    $( code($error_code), )?
                    help($error_help),
                )]
                $( #[cfg( $cfg )] )*
            ]
            $( $tail )*
        }
    };

    // Transparent variant.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $( #[cfg( $cfg:meta )] )*
        #[transparent]
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*

                #[doc = "Transparent error. Please see the inner fields."]
                #[error(transparent)]
                $( #[cfg( $cfg )] )*
            ]
            $( $tail )*
        }
    };

    // Unit variant.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $variant_name:ident ,
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*
                $variant_name,
            ]
            $( $tail )*
        }
    };

    // Tuple variant.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $variant_name:ident (
            $(
                $( #[ $field_meta:meta ] )*
                $field_visibility:vis $field_type:ty
            ),*
            $( , )?
        ) ,
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*
                $variant_name (
                    $(
                        $( #[ $field_meta ] )*
                        $field_visibility $field_type,
                    )*
                ) ,
            ]
            $( $tail )*
        }
    };

    // Struct-like variant.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
        $variant_name:ident {
            $(
                $( #[ $field_meta:meta ] )*
                $field_name:ident : $field_type:ty
            ),*
            $( , )?
        } ,
        $( $tail:tt )*
    ) => {
        $crate::error! {
            @variant
            [ $( $declaration )* ]
            [
                $( $accumulator )*
                $variant_name {
                    $(
                        $( #[ $field_meta ] )*
                        $field_name : $field_type,
                    )*
                } ,
            ]
            $( $tail )*
        }
    };

    // End point.
    (
        @variant
        [ $( $declaration:tt )* ]
        [ $( $accumulator:tt )* ]
    ) => {
        $crate::as_item! {
            $( $declaration )* {
                $( $accumulator )*
            }
        }
    };

    // Entry point.
    (
        $( #[doc = $documentation:expr ] )*
        $visibility:vis enum $error_name:ident {
            $( $variants:tt )*
        }
    ) => {
        $crate::error! {
            @variant
            [
                $( #[doc = $documentation ] )*
                #[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
                $visibility enum $error_name
            ]
            []
            $( $variants )*
        }
    };
}

mod domain;

pub use domain::{Error, Result as PoolResult, SendJobError, WorkerFailure};

#[cfg(test)]
mod tests {
    use miette::Diagnostic;

    error! {
        #[doc = "Errors used by the doctest above."]
        pub enum Error {
            #[code = E999]
            #[message = "the thing broke"]
            #[formatted_message("the thing broke: {0}")]
            #[help = "try turning it off and on again"]
            Broke(String),

            #[message = "nothing to see here"]
            #[help = "move along"]
            Quiet,
        }
    }

    #[test]
    fn formatted_message_and_help() {
        let error = Error::Broke("reason".to_string());

        assert_eq!(error.to_string(), "the thing broke: reason");
        assert_eq!(error.help().map(|help| help.to_string()), Some("try turning it off and on again".to_string()));
        assert_eq!(error.code().map(|code| code.to_string()), Some("E999".to_string()));
    }

    #[test]
    fn literal_message() {
        let error = Error::Quiet;

        assert_eq!(error.to_string(), "nothing to see here");
    }
}
