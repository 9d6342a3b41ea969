use std::collections::VecDeque;
use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DmrError, Result};
use crate::feature::{Feature, FeatureStream};
use crate::utils::pearson;

pub type FeatureIter<'a> = Box<dyn Iterator<Item = Result<Feature>> + 'a>;
pub type ClusterIter<'a> = Box<dyn Iterator<Item = Result<Cluster>> + 'a>;

/// Adjacent sites of one chromosome evaluated jointly, in strictly increasing position order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    features: Vec<Feature>,
}

impl Cluster {
    pub fn new(features: Vec<Feature>) -> Result<Cluster> {
        let first = features
            .first()
            .ok_or_else(|| DmrError::InvalidCluster("a cluster needs at least one feature".to_string()))?;

        for pair in features.windows(2) {
            if pair[1].chrom != first.chrom {
                return Err(DmrError::InvalidCluster(format!(
                    "cluster mixes chromosomes {} and {}",
                    first.chrom, pair[1].chrom
                )));
            }
            if pair[1].position <= pair[0].position {
                return Err(DmrError::InvalidCluster(format!(
                    "cluster positions not strictly increasing at {}:{}",
                    pair[1].chrom, pair[1].position
                )));
            }
            if pair[1].sample_len() != first.sample_len() {
                return Err(DmrError::Alignment {
                    sample: format!("{}:{}", pair[1].chrom, pair[1].position),
                    message: "sites of a cluster must share the sample order".to_string(),
                });
            }
        }

        Ok(Cluster { features })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn chrom(&self) -> &str {
        &self.features[0].chrom
    }

    pub fn start(&self) -> u64 {
        self.features[0].position
    }

    pub fn end(&self) -> u64 {
        self.features[self.features.len() - 1].position
    }

    pub fn positions(&self) -> Vec<u64> {
        self.features.iter().map(|f| f.position).collect()
    }

    pub fn sample_len(&self) -> usize {
        self.features[0].sample_len()
    }
}

/// Groups a feature stream into clusters. External clusterers plug in here.
pub trait ClusterBuilder: Send + Sync {
    fn build<'a>(&self, features: FeatureIter<'a>) -> ClusterIter<'a>;
}

/// Distance-and-correlation linkage along the genome.
///
/// A site links to the open cluster when it is on the same chromosome, at most `max_dist` bp
/// after the previous site, and correlated (Pearson >= `rho_min`) with one of the last
/// `max_skip + 1` members. Up to `max_skip` consecutive unlinked sites are held back and
/// absorbed if a later site links again; one more breaks the cluster. Clusters smaller than
/// `min_size` are dropped. A `rho_min` of -1 or less disables the correlation test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelatedClusterBuilder {
    pub max_dist: u64,
    pub max_skip: usize,
    pub rho_min: f64,
    pub min_size: usize,
}

impl CorrelatedClusterBuilder {
    pub fn new(max_dist: u64, max_skip: usize, rho_min: f64, min_size: usize) -> Self {
        CorrelatedClusterBuilder { max_dist, max_skip, rho_min, min_size }
    }

    fn near(&self, previous: &Feature, candidate: &Feature) -> bool {
        previous.chrom == candidate.chrom
            && candidate.position > previous.position
            && candidate.position - previous.position <= self.max_dist
    }

    fn correlated(&self, open: &[Feature], candidate: &Feature) -> bool {
        if self.rho_min <= -1.0 {
            return true;
        }
        open.iter()
            .rev()
            .take(self.max_skip + 1)
            .any(|member| pearson(&member.values, &candidate.values) >= self.rho_min)
    }
}

impl ClusterBuilder for CorrelatedClusterBuilder {
    fn build<'a>(&self, features: FeatureIter<'a>) -> ClusterIter<'a> {
        Box::new(LinkageIter {
            builder: self.clone(),
            features,
            requeue: VecDeque::new(),
            open: Vec::new(),
            pending: Vec::new(),
            exhausted: false,
        })
    }
}

struct LinkageIter<'a> {
    builder: CorrelatedClusterBuilder,
    features: FeatureIter<'a>,
    requeue: VecDeque<Feature>,
    open: Vec<Feature>,
    pending: Vec<Feature>,
    exhausted: bool,
}

impl LinkageIter<'_> {
    /// Closes the open cluster, returning it when it is large enough.
    /// Held-back sites and `next` go back to the queue to seed the following cluster.
    fn close(&mut self, next: Option<Feature>) -> Option<Result<Cluster>> {
        let members = std::mem::take(&mut self.open);
        for feature in self.pending.drain(..).chain(next).rev() {
            self.requeue.push_front(feature);
        }

        if members.len() >= self.builder.min_size.max(1) {
            Some(Cluster::new(members))
        } else {
            if !members.is_empty() {
                debug!("Dropping cluster of {} site(s) below min_size", members.len());
            }
            None
        }
    }

    fn push(&mut self, feature: Feature) -> Option<Result<Cluster>> {
        if self.open.is_empty() {
            self.open.push(feature);
            return None;
        }

        let near = self
            .pending
            .last()
            .or(self.open.last())
            .map_or(true, |previous| self.builder.near(previous, &feature));
        if !near {
            return self.close(Some(feature));
        }
        if self.builder.correlated(&self.open, &feature) {
            self.open.append(&mut self.pending);
            self.open.push(feature);
            return None;
        }
        if self.pending.len() < self.builder.max_skip {
            self.pending.push(feature);
            return None;
        }
        self.close(Some(feature))
    }
}

impl Iterator for LinkageIter<'_> {
    type Item = Result<Cluster>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let feature = match self.requeue.pop_front() {
                Some(feature) => feature,
                None if self.exhausted => {
                    if self.open.is_empty() && self.pending.is_empty() {
                        return None;
                    }
                    match self.close(None) {
                        Some(cluster) => return Some(cluster),
                        None => continue,
                    }
                }
                None => match self.features.next() {
                    Some(Ok(feature)) => feature,
                    Some(Err(e)) => {
                        self.exhausted = true;
                        self.open.clear();
                        self.pending.clear();
                        return Some(Err(e));
                    }
                    None => {
                        self.exhausted = true;
                        continue;
                    }
                },
            };

            if let Some(cluster) = self.push(feature) {
                return Some(cluster);
            }
        }
    }
}

/// Restartable producer of cluster streams: every call starts again from the beginning.
pub trait ClusterSource: Send + Sync {
    /// Sample identifiers in the order of every feature's values
    fn samples(&self) -> &[String];
    fn clusters(&self) -> Result<ClusterIter<'_>>;
}

/// Re-reads a methylation matrix and re-runs the builder on each request
pub struct FileClusterSource<B: ClusterBuilder> {
    path: PathBuf,
    builder: B,
    samples: Vec<String>,
}

impl<B: ClusterBuilder> FileClusterSource<B> {
    pub fn new<P: Into<PathBuf>>(path: P, builder: B) -> Result<Self> {
        let path = path.into();
        let samples = FeatureStream::open(&path)?.samples().to_vec();
        Ok(FileClusterSource { path, builder, samples })
    }
}

impl<B: ClusterBuilder> ClusterSource for FileClusterSource<B> {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn clusters(&self) -> Result<ClusterIter<'_>> {
        let stream = FeatureStream::open(&self.path)?;
        Ok(self.builder.build(Box::new(stream)))
    }
}

/// In-memory clusters, handed out again on every request
pub struct VecClusterSource {
    samples: Vec<String>,
    clusters: Vec<Cluster>,
}

impl VecClusterSource {
    pub fn new(samples: Vec<String>, clusters: Vec<Cluster>) -> Self {
        VecClusterSource { samples, clusters }
    }
}

impl ClusterSource for VecClusterSource {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn clusters(&self) -> Result<ClusterIter<'_>> {
        Ok(Box::new(self.clusters.iter().cloned().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(chrom: &str, pos: u64, values: &[f64]) -> Feature {
        Feature::new(chrom, pos, values.to_vec())
    }

    fn build(builder: &CorrelatedClusterBuilder, features: Vec<Feature>) -> Vec<Cluster> {
        let iter: FeatureIter = Box::new(features.into_iter().map(Ok));
        builder.build(iter).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_cluster_invariants() {
        assert!(matches!(Cluster::new(vec![]), Err(DmrError::InvalidCluster(_))), "an empty cluster is invalid");
        assert!(matches!(Cluster::new(vec![site("chr1", 10, &[1.0]), site("chr1", 10, &[1.0])]), Err(DmrError::InvalidCluster(_))),
            "positions must be strictly increasing");
        assert!(matches!(Cluster::new(vec![site("chr1", 10, &[1.0]), site("chr2", 20, &[1.0])]), Err(DmrError::InvalidCluster(_))),
            "a cluster lives on one chromosome");
        let c = Cluster::new(vec![site("chr1", 10, &[1.0, 2.0]), site("chr1", 20, &[1.0, 3.0])]).unwrap();
        assert_eq!((c.chrom(), c.start(), c.end(), c.len(), c.sample_len()), ("chr1", 10, 20, 2, 2));
    }

    #[test]
    fn test_four_close_sites_make_one_cluster() {
        let builder = CorrelatedClusterBuilder::new(400, 2, -1.0, 3);
        let features = (0..4).map(|i| site("chr1", 1000 + 50 * i, &[0.1, 0.2, 0.3, 0.4, 0.5])).collect();
        let clusters = build(&builder, features);
        assert_eq!(clusters.len(), 1, "four sites 50bp apart within max_dist=400 form one cluster");
        assert_eq!(clusters[0].len(), 4);
    }

    #[test]
    fn test_distance_and_chromosome_break_clusters() {
        let builder = CorrelatedClusterBuilder::new(100, 0, -1.0, 2);
        let features = vec![
            site("chr1", 100, &[1.0]),
            site("chr1", 150, &[1.0]),
            site("chr1", 400, &[1.0]), // too far
            site("chr1", 450, &[1.0]),
            site("chr2", 460, &[1.0]), // other chromosome
            site("chr2", 470, &[1.0]),
        ];
        let clusters = build(&builder, features);
        assert_eq!(clusters.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2, 2]);
        assert_eq!(clusters[2].chrom(), "chr2");
    }

    #[test]
    fn test_min_size_filters_small_clusters() {
        let builder = CorrelatedClusterBuilder::new(100, 0, -1.0, 3);
        let features = vec![
            site("chr1", 100, &[1.0]),
            site("chr1", 150, &[1.0]),
            site("chr1", 1000, &[1.0]),
            site("chr1", 1010, &[1.0]),
            site("chr1", 1020, &[1.0]),
        ];
        let clusters = build(&builder, features);
        assert_eq!(clusters.len(), 1, "the two-site group is below min_size");
        assert_eq!(clusters[0].start(), 1000);
    }

    #[test]
    fn test_correlation_gate_with_skip() {
        let up = [0.1, 0.2, 0.3, 0.4];
        let down = [0.4, 0.3, 0.2, 0.1];
        let features = vec![
            site("chr1", 10, &up),
            site("chr1", 20, &up),
            site("chr1", 30, &down),
            site("chr1", 40, &up),
        ];

        let strict = CorrelatedClusterBuilder::new(100, 0, 0.5, 1);
        let sizes: Vec<usize> = build(&strict, features.clone()).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1], "an anti-correlated site breaks the cluster without skipping");

        let skipping = CorrelatedClusterBuilder::new(100, 1, 0.5, 1);
        let sizes: Vec<usize> = build(&skipping, features.clone()).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4], "with max_skip=1 the last site links back and the skipped site is absorbed");
    }

    #[test]
    fn test_builder_propagates_errors() {
        let builder = CorrelatedClusterBuilder::new(100, 0, -1.0, 1);
        let features: FeatureIter = Box::new(vec![
            Ok(site("chr1", 10, &[1.0])),
            Err(DmrError::Parse { line: 3, message: "bad".to_string() }),
        ].into_iter());
        let results: Vec<Result<Cluster>> = builder.build(features).collect();
        assert!(results.iter().any(|r| r.is_err()), "a feature error must surface in the cluster stream");
    }

    #[test]
    fn test_vec_source_is_restartable() {
        let c = Cluster::new(vec![site("chr1", 1, &[1.0])]).unwrap();
        let source = VecClusterSource::new(vec!["s1".to_string()], vec![c.clone(), c]);
        assert_eq!(source.clusters().unwrap().count(), 2);
        assert_eq!(source.clusters().unwrap().count(), 2, "a second request restarts the stream");
    }
}
