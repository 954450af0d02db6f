// Core modules implementing the access gate, export producer and their collaborators.
pub mod cursor;
pub mod error;
pub mod export;
pub mod field_map;
pub mod gate;
pub mod identity;
pub mod record;
pub mod registry;
