//! Crawls TLS protocol support and certificate facts for host names, and
//! shares a per-IP consensus verdict between host names served from the
//! same address.

pub mod cache;
pub mod certificate;
pub mod crawler;
pub mod engine;
pub mod input;
pub mod model;
pub mod output;
pub mod probe;
pub mod scan;
pub mod scan_result;
pub mod util;
