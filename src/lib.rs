pub mod config;
pub mod db;
pub mod dom;
pub mod export;
pub mod http;
pub mod linking;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod report_service;
pub mod stores;
pub mod vtex;
