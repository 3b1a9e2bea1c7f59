//! Archive a local directory into a gzip-compressed tarball and upload it to
//! a Google Drive folder.
//!
//! The archive is streamed straight from the filesystem walk through tar
//! framing and gzip compression into one or more sinks (see
//! [`archive::write_archive`]), staged on local disk, then uploaded.

pub mod archive;
pub mod auth;
pub mod backup;
pub mod cli;
pub mod config;
pub mod remote;
pub mod staging;
