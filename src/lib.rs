#![forbid(unsafe_code)]

pub mod cli;
pub mod confluence;
pub mod convert;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod paths;
pub mod pipeline;
pub mod storage;
