use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A class roster entry. Maintained by the surrounding administration layer;
/// read here to enrol voters and address notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    #[serde(rename = "_id")]
    pub id: Id,
    pub class_id: Id,
    pub name: String,
    pub email: String,
}

impl Student {
    pub fn new(class_id: Id, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Id::new(),
            class_id,
            name: name.into(),
            email: email.into(),
        }
    }
}
