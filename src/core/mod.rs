// Core modules: line format, validation, scanning, locking, and the two table engines.
pub mod codec;
pub mod error;
pub mod format;
pub mod lite;
pub mod lock;
pub mod options;
pub mod ordered;
pub mod scan;
pub mod schema;
pub mod stream;
pub mod table;
pub mod tabular;
