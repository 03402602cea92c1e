//! Compile-time kernel configuration.
//!
//! All capacities are fixed here; the kernel never allocates beyond these
//! pools after [`System::init`](crate::System::init).

/// Numerically largest (weakest) task priority. 0 is the strongest.
pub const MAX_PRIORITY: u8 = 7;

/// Number of priority bands (`MAX_PRIORITY + 1`).
pub const PRIORITY_LEVELS: usize = MAX_PRIORITY as usize + 1;

/// Task pool size, including the idle task.
pub const MAX_TASKS: usize = 8;

pub const MAX_QUEUES: usize = 4;
pub const MAX_SEMAPHORES: usize = 8;
pub const MAX_MUTEXES: usize = 4;

/// Tick interrupt frequency.
pub const TICK_HZ: u32 = 1_000;

/// Maximum object name length in bytes, excluding any terminator.
pub const TASK_NAME_LEN: usize = 15;

/// Stack size used when `task_create` is given a size of zero.
pub const DEFAULT_STACK_SIZE: usize = 1024;

// Stack size classes. A task gets the smallest slot its requested size fits.
pub const STACK_SIZE_SMALL: usize = 512;
pub const STACK_COUNT_SMALL: usize = 4;
pub const STACK_SIZE_MEDIUM: usize = 1024;
pub const STACK_COUNT_MEDIUM: usize = 6;
pub const STACK_SIZE_LARGE: usize = 2048;
pub const STACK_COUNT_LARGE: usize = 2;

// Queue buffer size classes, covering `capacity × element_size` bytes.
pub const QUEUE_BUF_SIZE_SMALL: usize = 64;
pub const QUEUE_BUF_COUNT_SMALL: usize = 8;
pub const QUEUE_BUF_SIZE_MEDIUM: usize = 256;
pub const QUEUE_BUF_COUNT_MEDIUM: usize = 4;
pub const QUEUE_BUF_SIZE_LARGE: usize = 1024;
pub const QUEUE_BUF_COUNT_LARGE: usize = 2;

/// Timeout sentinel: block indefinitely.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Timeout sentinel: do not block.
pub const NO_WAIT: u32 = 0;
