pub mod core_assets;

pub mod grace;

pub mod holding;

pub mod orchestrator;

pub mod whipsaw;
