use super::descriptor::GatherDescriptor;

/// Lowering strategy chosen for a gather from its shapes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatherClass {
    /// The output has no elements.
    Empty,
    /// Every indexed operand dim has extent 1, so all index vectors read the same window.
    Broadcast,
    /// Exactly one index vector: a single dynamic slice.
    Slice,
    /// Needs a counted loop over the index vectors.
    General,
}

impl GatherClass {
    /// Classes rewritten even when only simple gathers are eliminated.
    pub fn is_simple(self) -> bool {
        !matches!(self, GatherClass::General)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GatherClass::Empty => "empty",
            GatherClass::Broadcast => "broadcast",
            GatherClass::Slice => "slice",
            GatherClass::General => "loop",
        }
    }
}

/// Picks the cheapest correct lowering; first match wins.
pub fn classify(desc: &GatherDescriptor) -> GatherClass {
    if desc.trip_count == 0 || desc.output_element_count() == 0 {
        return GatherClass::Empty;
    }
    let all_indexed_degenerate = desc
        .dimension_numbers
        .start_index_map
        .iter()
        .all(|dim| desc.operand_dims[*dim] == 1);
    if all_indexed_degenerate {
        return GatherClass::Broadcast;
    }
    if desc.trip_count == 1 {
        return GatherClass::Slice;
    }
    GatherClass::General
}
