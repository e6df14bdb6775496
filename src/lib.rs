pub mod db;
pub mod pipeline;
pub mod storage;
