pub mod buckets;

pub mod engine;

pub mod protected;

pub mod sizing;
