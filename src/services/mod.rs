pub mod restore;
pub mod storage_service;
