use anyhow::Result;

cfg_if::cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        use anyhow::anyhow;
        use tikv_jemalloc_ctl::{epoch, epoch_mib, stats};

        /// Reads jemalloc's `stats.allocated`.
        pub struct MemSampler {
            epoch: epoch_mib,
            allocated: stats::allocated_mib,
        }

        impl MemSampler {
            pub fn new() -> Result<Self> {
                let epoch_handle = epoch::mib().map_err(|e| anyhow!("jemalloc epoch lookup: {}", e))?;
                let allocated = stats::allocated::mib()
                    .map_err(|e| anyhow!("jemalloc stats.allocated lookup: {}", e))?;
                Ok(MemSampler { epoch: epoch_handle, allocated })
            }

            /// Bytes currently allocated by the process, or 0 if jemalloc refuses to tell.
            pub fn sample(&self) -> usize {
                // The statistics are cached until the epoch is advanced.
                if self.epoch.advance().is_err() {
                    return 0;
                }
                self.allocated.read().unwrap_or(0)
            }
        }
    } else {
        pub struct MemSampler {}

        impl MemSampler {
            pub fn new() -> Result<Self> {
                log::warn!("memory sampling is supported only for linux without sanitizers");
                Ok(MemSampler {})
            }

            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}
