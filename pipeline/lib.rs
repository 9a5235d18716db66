#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod adapter;
pub mod config;
pub mod data;
pub mod matrix;
pub mod residualize;
pub mod rows;
pub mod run;

#[path = "../forest/mod.rs"]
pub mod forest;

#[path = "../policy/mod.rs"]
pub mod policy;

#[path = "../report/mod.rs"]
pub mod report;
