pub mod cli;
pub mod config;
pub mod durability;
pub mod record;
pub mod rollup;
pub mod storage;
pub mod web;
