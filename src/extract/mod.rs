// src/extract/mod.rs
//! Page segmentation into content blocks.

pub mod blocks;

pub use blocks::{extract_blocks, BlockExtractor, Blocks, ParsedPage};
