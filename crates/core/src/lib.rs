//! Keel core types: object metadata, the Configuration kind, API errors,
//! selectors and the watch stream primitive shared by every layer.

#![forbid(unsafe_code)]

pub mod config;
pub mod configuration;
pub mod context;
pub mod error;
pub mod meta;
pub mod parsers;
pub mod selector;
pub mod watch;

pub use configuration::{Configuration, ConfigurationList};
pub use context::Context;
pub use error::{ApiError, ApiResult, FieldError, FieldErrorKind, Status};
pub use meta::{DeleteOptions, ListMeta, ObjectList, ObjectMeta, Resource, TypeMeta};
pub use selector::{Selector, Set};
pub use watch::{Watch, WatchEvent};

pub mod prelude {
    pub use super::{
        ApiError, ApiResult, Configuration, ConfigurationList, Context, DeleteOptions, ObjectList, ObjectMeta, Resource,
        Selector, Set, Watch, WatchEvent,
    };
}
