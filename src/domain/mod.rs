pub mod errors;

pub mod events;

pub mod ledger;

pub mod ports;

pub mod position;

pub mod protection;

pub mod regime;

pub mod repositories;

pub mod types;
