use std::fmt::Display;

use serde_repr::{Deserialize_repr, Serialize_repr};

/// A kind of authenticated user, having defined rights.
pub trait User {
    /// The rights of this user type.
    const RIGHTS: Rights;
}

/// Different privilege levels.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Rights {
    Student = 0,
    Admin = 1,
}

impl Display for Rights {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}",
            match self {
                Self::Student => "student",
                Self::Admin => "admin",
            }
        )
    }
}

/// A student acting as voter or candidate.
pub struct Voter;

/// An election administrator.
pub struct Admin;

impl User for Voter {
    const RIGHTS: Rights = Rights::Student;
}

impl User for Admin {
    const RIGHTS: Rights = Rights::Admin;
}
