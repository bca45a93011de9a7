mod frame;
mod heap;
mod ic;
mod intrinsics;
mod value;
mod vm;

pub use frame::Frame;
pub use heap::{GcStats, Generation, GenerationalHeap, HeapObject, ObjRef};
pub use ic::{CacheState, DispatchCache};
pub use intrinsics::Intrinsic;
pub use value::Value;
pub use vm::Vm;
