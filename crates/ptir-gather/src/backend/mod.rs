//! Portable tensor IR (PTIR) graph, editing utilities and rewrite passes.

pub mod builder;
pub mod index;
pub mod optimizer;
pub mod passes;
pub mod pipeline;
pub mod ptir_utils;
pub mod rewriter;
pub mod shape_helpers;
pub mod shape_inference;
pub mod spec;
pub mod verify;
