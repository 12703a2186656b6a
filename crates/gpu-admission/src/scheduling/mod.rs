pub mod allocate;
pub mod device;
pub mod filter;
pub mod node_view;
pub mod quota;

pub use allocate::Allocator;
pub use device::Device;
pub use filter::GpuFilter;
pub use node_view::NodeView;
pub use quota::QuotaStore;
