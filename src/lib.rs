pub mod calendar;
pub mod catalog;
pub mod config;
pub mod db;
pub mod eligibility;
pub mod error;
pub mod layout;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod rows;
pub mod sources;
pub mod table;
pub mod upsert;
