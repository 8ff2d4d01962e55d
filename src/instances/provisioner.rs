use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::core::remote::{RemoteError, RemotePlane};
use crate::instances::common::bounded;

/// Drop repeated boot parameters, keeping the first occurrence of each
pub fn dedupe_boot_parameters(params: &[String]) -> Vec<String> {
    let mut seen: HashSet<&String> = HashSet::new();
    params
        .iter()
        .filter(|p| seen.insert(*p))
        .cloned()
        .collect()
}

/// Images, configures and reboots a node
pub struct Provisioner {
    plane: Arc<dyn RemotePlane>,
    control_timeout: Duration,
    /// Imaging and reboots wait on the node itself
    long_running_timeout: Duration,
}

impl Provisioner {
    pub fn new(plane: Arc<dyn RemotePlane>, control_timeout: Duration, long_running_timeout: Duration) -> Self {
        Self {
            plane,
            control_timeout,
            long_running_timeout,
        }
    }

    pub async fn apply_image(&self, node: &str, image: &str) -> Result<(), RemoteError> {
        debug!("Apply image: {}", image);
        bounded("image", self.long_running_timeout, self.plane.image(node, image)).await
    }

    /// Apply the de-duplicated boot parameters, returning what was sent
    pub async fn apply_boot_parameters(&self, node: &str, params: &[String]) -> Result<Vec<String>, RemoteError> {
        let params = dedupe_boot_parameters(params);
        debug!("Apply boot params: {:?}", params);
        bounded(
            "bootparameters",
            self.control_timeout,
            self.plane.bootparameters(node, &params, false),
        )
        .await?;
        Ok(params)
    }

    /// Blocking reboot
    pub async fn reboot(&self, node: &str) -> Result<(), RemoteError> {
        info!("Reboot node (blocking)");
        bounded("reset", self.long_running_timeout, self.plane.reset(node, true)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::MockRemotePlane;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedupe_preserves_first_seen_order() {
        assert_eq!(
            dedupe_boot_parameters(&strings(&["a", "b", "a", "c"])),
            strings(&["a", "b", "c"])
        );
        assert_eq!(
            dedupe_boot_parameters(&strings(&["iommu=pt", "quiet", "iommu=pt"])),
            strings(&["iommu=pt", "quiet"])
        );
        assert!(dedupe_boot_parameters(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_boot_parameters_sent_deduplicated() {
        let mut plane = MockRemotePlane::new();
        plane
            .expect_bootparameters()
            .withf(|node, params, delete| node == "n1" && params.to_vec() == strings(&["a", "b"]) && !*delete)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let provisioner = Provisioner::new(Arc::new(plane), Duration::from_secs(1), Duration::from_secs(1));
        let sent = provisioner
            .apply_boot_parameters("n1", &strings(&["a", "b", "a"]))
            .await
            .unwrap();
        assert_eq!(sent, strings(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_reboot_is_blocking() {
        let mut plane = MockRemotePlane::new();
        plane
            .expect_reset()
            .withf(|node, blocking| node == "n1" && *blocking)
            .times(1)
            .returning(|_, _| Ok(()));

        let provisioner = Provisioner::new(Arc::new(plane), Duration::from_secs(1), Duration::from_secs(1));
        provisioner.reboot("n1").await.unwrap();
    }
}
