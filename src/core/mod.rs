//! Filesystem core
//!
//! Read path: [`store`] -> [`chain`] -> [`tag_stream`] -> [`directory`] -> [`extract`].
//! Write path: [`directory`] -> [`tag_stream`] -> [`insert`] -> [`store`].

pub mod block;
pub mod chain;
pub mod directory;
pub mod extract;
pub mod insert;
pub mod io;
pub mod object;
pub mod store;
pub mod tag_stream;
pub mod varlen;
