//! Durable record of every captured frame and the deduplicated view derived
//! from it.

mod cluster;
mod journal;

pub use cluster::*;
pub use journal::*;

impl Journal {
    /// Rebuilds the clustered view from the whole journal and rewrites the
    /// filtered-results file.
    pub fn deduplicate(&self, distance: f64) -> Result<ClusterIndex> {
        let records = self.load()?;
        let clusters = cluster_and_merge(&build_index(&records), distance);
        self.write_filtered(&clusters)?;

        debug!(
            "deduplicated {} frames into {} clusters",
            records.len(),
            clusters.values().flat_map(|s| s.values()).map(Vec::len).sum::<usize>()
        );

        Ok(clusters)
    }
}
