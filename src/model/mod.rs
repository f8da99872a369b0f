pub mod audit;
pub mod auth;
pub mod ballot;
pub mod election;
pub mod eligibility;
pub mod mongodb;
pub mod nomination;
pub mod policy;
pub mod student;
pub mod token;
