#![forbid(unsafe_code)]

pub mod cli;
pub mod discover;
pub mod epub;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod page;
pub mod pipeline;
pub mod plan;
pub mod process;
pub mod raw_store;
pub mod slug;
pub mod status_store;
pub mod walker;
pub mod workspace;
pub mod xhtml;
