//! Service cores: bucket CRUD, object I/O, and resumable uploads.

pub mod bucket;
pub mod object;
pub mod resumable;
