mod bson;
mod collection;
mod errors;

pub use bson::{id_as_string, optional_datetime, Id};
pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use errors::{is_duplicate_key_error, is_transient_transaction_error};
