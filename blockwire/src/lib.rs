//! Chunked voxel world engine: chunks grouped in regions persisted to region files, 
//! block behaviors reacting to neighbor changes and scheduled ticks, entities and a
//! notification bus for every change.

pub mod io;
pub mod face;

pub mod block;
pub mod chunk;
pub mod region;
pub mod generator;
pub mod entity;
pub mod event;
pub mod world;
