use crate::backend::spec::{Program, Region, RegionId};

/// Program-level state a pass needs while rewriting one computation.
///
/// Regions created by a pass are collected here and appended to the program by the runner once
/// the computation has been processed.
#[derive(Debug, Clone)]
pub struct PassContext {
    next_region: usize,
    new_regions: Vec<Region>,
}

impl PassContext {
    /// Creates a context that hands out region ids starting at `first_free`.
    pub fn new(first_free: RegionId) -> Self {
        Self {
            next_region: first_free.0,
            new_regions: Vec::new(),
        }
    }

    pub fn for_program(program: &Program) -> Self {
        Self::new(program.next_region_id())
    }

    pub fn allocate_region_id(&mut self) -> RegionId {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        id
    }

    pub fn push_region(&mut self, region: Region) {
        self.next_region = self.next_region.max(region.id.0 + 1);
        self.new_regions.push(region);
    }

    pub fn new_regions(&self) -> &[Region] {
        &self.new_regions
    }

    pub fn take_regions(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.new_regions)
    }
}
