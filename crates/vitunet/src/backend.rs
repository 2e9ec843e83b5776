//! Backend selection driven by cargo features.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray` CPU backend.

use burn::prelude::Device;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Backend the CLI runs on.
        pub type SelectedBackend = burn::backend::Cuda;
        const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        /// Backend the CLI runs on.
        pub type SelectedBackend = burn::backend::Wgpu;
        const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        /// Backend the CLI runs on.
        pub type SelectedBackend = burn::backend::NdArray;
        const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Device type of [`SelectedBackend`].
pub type SelectedDevice = Device<SelectedBackend>;

/// Default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}

/// Human-readable backend name for logs and `info`.
pub const fn get_backend_name() -> &'static str {
    BACKEND_NAME
}
