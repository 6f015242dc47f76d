use crate::config::ClassifierConfig;
use crate::model::{BundleInfo, ClassificationFlag};
use common::SafeMap;
use std::collections::HashMap;
use tracing::{debug, info};

/// Assigns and caches the billing classification of each uid.
///
/// Sample bundles are the SIM profile apps themselves. Their presence decides
/// whether SIM-channel installs are attributed to a SIM at all.
pub struct UidFlagClassifier {
    policy: ClassifierConfig,
    flags: SafeMap<u32, ClassificationFlag>,
    sample_bundles: SafeMap<u32, BundleInfo>,
}

impl UidFlagClassifier {
    pub fn new(policy: ClassifierConfig) -> Self {
        Self {
            policy,
            flags: SafeMap::new(),
            sample_bundles: SafeMap::new(),
        }
    }

    pub fn policy(&self) -> &ClassifierConfig {
        &self.policy
    }

    fn is_sim(&self, package: &str) -> bool {
        self.policy.sim_packages.iter().any(|p| p == package)
    }

    fn is_sim2(&self, package: &str) -> bool {
        self.policy.sim2_packages.iter().any(|p| p == package)
    }

    fn is_sim_anchor(&self, package: &str) -> bool {
        self.policy.sim_anchor_packages.iter().any(|p| p == package)
    }

    fn is_sim2_anchor(&self, package: &str) -> bool {
        self.policy.sim2_anchor_packages.iter().any(|p| p == package)
    }

    fn sim_flag(&self) -> ClassificationFlag {
        if self.policy.display_anchor_separately {
            ClassificationFlag::SimBasic
        } else {
            ClassificationFlag::Sim
        }
    }

    fn sim2_flag(&self) -> ClassificationFlag {
        if self.policy.display_anchor_separately {
            ClassificationFlag::Sim2Basic
        } else {
            ClassificationFlag::Sim2
        }
    }

    pub fn cached(&self, uid: u32) -> Option<ClassificationFlag> {
        self.flags.find(&uid)
    }

    /// Cached flag of `uid`, resolving and caching one if absent.
    pub fn classify(&self, uid: u32) -> ClassificationFlag {
        if let Some(flag) = self.flags.find(&uid) {
            return flag;
        }

        let flag = if self.sample_bundles.is_empty() {
            ClassificationFlag::Default
        } else {
            let mut has_sim = false;
            self.sample_bundles
                .iterate(|_, bundle| has_sim |= self.is_sim(&bundle.package_name));
            if has_sim {
                self.sim_flag()
            } else {
                ClassificationFlag::Default
            }
        };

        // A concurrent classification may have won; its answer stands.
        if !self.flags.insert(uid, flag) {
            return self.flags.find(&uid).unwrap_or(flag);
        }
        flag
    }

    /// Classifies a whole bundle listing and returns the flags it assigned.
    pub fn classify_batch(&self, bundles: &[BundleInfo]) -> HashMap<u32, ClassificationFlag> {
        for bundle in bundles.iter().filter(|b| b.is_valid()) {
            if self.is_sim(&bundle.package_name) || self.is_sim2(&bundle.package_name) {
                self.sample_bundles.ensure_insert(bundle.uid, bundle.clone());
            }
        }

        let samples = self.sample_bundles.snapshot();
        let exist_sim = samples.values().any(|b| self.is_sim(&b.package_name));
        let exist_sim2 = samples.values().any(|b| self.is_sim2(&b.package_name));
        let earliest = samples
            .values()
            .min_by_key(|b| (b.install_time, b.uid))
            .map(|b| b.package_name.clone());

        let mut ordered: Vec<&BundleInfo> = bundles.iter().filter(|b| b.is_valid()).collect();
        ordered.sort_by_key(|b| b.uid);

        let mut assigned = HashMap::new();
        for bundle in ordered {
            let Some(flag) = self.resolve(bundle, exist_sim, exist_sim2, earliest.as_deref()) else {
                continue;
            };
            if self.flags.find(&bundle.uid) == Some(ClassificationFlag::Uninstalled) {
                continue;
            }
            self.flags.ensure_insert(bundle.uid, flag);
            assigned.insert(bundle.uid, flag);
        }
        info!(
            bundles = bundles.len(),
            assigned = assigned.len(),
            sample_bundles = samples.len(),
            "classification batch done"
        );
        assigned
    }

    fn resolve(
        &self,
        bundle: &BundleInfo,
        exist_sim: bool,
        exist_sim2: bool,
        earliest: Option<&str>,
    ) -> Option<ClassificationFlag> {
        let package = bundle.package_name.as_str();
        if self.policy.display_anchor_separately {
            if self.is_sim(package) || self.is_sim_anchor(package) {
                return Some(ClassificationFlag::SimBasic);
            }
            if self.is_sim2(package) || self.is_sim2_anchor(package) {
                return Some(ClassificationFlag::Sim2Basic);
            }
        }

        let source = bundle.install_source.as_str();
        if source == self.policy.sim2_install_source {
            return Some(if exist_sim2 {
                ClassificationFlag::Sim2
            } else {
                ClassificationFlag::Default
            });
        }
        if source == self.policy.sim_install_source {
            return Some(if exist_sim {
                ClassificationFlag::Sim
            } else {
                ClassificationFlag::Default
            });
        }
        if source == self.policy.default_install_source {
            if !exist_sim && !exist_sim2 {
                return Some(ClassificationFlag::Default);
            }
            if exist_sim2 && earliest.is_some_and(|p| self.is_sim2(p)) {
                return Some(self.sim2_flag());
            }
            if exist_sim {
                return Some(self.sim_flag());
            }
            return Some(ClassificationFlag::Default);
        }
        None
    }

    pub fn mark_uninstalled(&self, uid: u32) {
        self.flags.ensure_insert(uid, ClassificationFlag::Uninstalled);
    }

    pub fn is_sample_bundle(&self, uid: u32) -> bool {
        self.sample_bundles.contains(&uid)
    }

    /// Drops every cached entry of `uid`. Returns the sample bundle if `uid` was one.
    pub fn clear(&self, uid: u32) -> Option<BundleInfo> {
        self.flags.erase(&uid);
        let removed = self.sample_bundles.erase(&uid);
        if self.sample_bundles.is_empty() {
            self.flags.clear();
        }
        removed
    }

    /// Flag that rows of a removed sample bundle were attributed with.
    pub fn flag_of_sample(&self, bundle: &BundleInfo) -> Option<ClassificationFlag> {
        if self.is_sim(&bundle.package_name) {
            Some(self.sim_flag())
        } else if self.is_sim2(&bundle.package_name) {
            Some(self.sim2_flag())
        } else {
            None
        }
    }

    /// Sends every uid cached as `flag` back to Default.
    pub fn reassign(&self, flag: ClassificationFlag) -> usize {
        let mut moved = 0;
        self.flags.retain(|_, current| {
            if *current == flag {
                *current = ClassificationFlag::Default;
                moved += 1;
            }
            true
        });
        debug!(?flag, moved, "reassigned cached flags");
        moved
    }

    pub fn clear_all(&self) {
        self.flags.clear();
        self.sample_bundles.clear();
    }
}
