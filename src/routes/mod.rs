//! HTTP route table.

pub mod routes;
