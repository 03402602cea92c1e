//! Error types
//!
//! Every fallible kernel entry point returns an operation-specific error enum
//! whose variants are a subset of [`ResultCode`]. The `define_error!` macro
//! generates the enums and their lossless conversion into `ResultCode`.
use core::fmt;

/// The union of every error condition the kernel can report.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// An invalid object handle was given.
    Null = -1,
    /// A parameter was out of range or malformed.
    BadParam = -2,
    /// The object or the calling context was in a state that forbids the
    /// operation.
    BadState = -3,
    /// A blocking operation reached its deadline.
    Timeout = -4,
    /// A non-blocking send found the queue full.
    Full = -5,
    /// A non-blocking receive found the queue empty.
    Empty = -6,
    /// A semaphore post found the count saturated with no waiter.
    Overflow = -7,
    /// A mutex unlock was attempted by a task that is not the owner.
    NotOwner = -8,
    /// A mutex lock was attempted by the task that already owns it.
    Recursive = -9,
    /// A blocking wait was abandoned because the object was deleted.
    ObjectDeleted = -10,
    /// A pool was exhausted or the requested size fits no pool.
    AllocationFailed = -11,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl From<crate::error::BadContextError> for $Name {
            #[inline]
            fn from(_: crate::error::BadContextError) -> Self {
                Self::BadState
            }
        }
    };
}

/// `BadState`, reported when an operation requiring the CPU Lock to be
/// inactive is invoked while it is held. Converted into the `BadState`
/// variant of the caller's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BadContextError {
    BadState,
}

define_error! {
    /// Error type for kernel-global queries.
    pub enum QueryKernelError {
        BadState,
    }
}

define_error! {
    /// Error type for task creation.
    pub enum CreateTaskError {
        BadParam,
        BadState,
        AllocationFailed,
    }
}

define_error! {
    /// Error type for task deletion.
    pub enum DeleteTaskError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for relative delays.
    pub enum DelayError {
        BadParam,
        BadState,
    }
}

define_error! {
    /// Error type for task suspension and resumption.
    pub enum SuspendTaskError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for task state queries.
    pub enum QueryTaskError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for queue creation.
    pub enum CreateQueueError {
        BadParam,
        BadState,
        AllocationFailed,
    }
}

define_error! {
    /// Error type for queue deletion.
    pub enum DeleteQueueError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for sending to a queue.
    pub enum SendQueueError {
        Null,
        BadParam,
        BadState,
        Full,
        Timeout,
        ObjectDeleted,
    }
}

define_error! {
    /// Error type for receiving from a queue.
    pub enum ReceiveQueueError {
        Null,
        BadParam,
        BadState,
        Empty,
        Timeout,
        ObjectDeleted,
    }
}

define_error! {
    /// Error type for queue state queries.
    pub enum QueryQueueError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for semaphore creation.
    pub enum CreateSemaphoreError {
        BadParam,
        BadState,
        AllocationFailed,
    }
}

define_error! {
    /// Error type for semaphore deletion.
    pub enum DeleteSemaphoreError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for acquiring a semaphore.
    pub enum WaitSemaphoreError {
        Null,
        BadState,
        Timeout,
        ObjectDeleted,
    }
}

define_error! {
    /// Error type for posting a semaphore.
    pub enum PostSemaphoreError {
        Null,
        BadState,
        Overflow,
    }
}

define_error! {
    /// Error type for semaphore state queries.
    pub enum QuerySemaphoreError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for mutex creation.
    pub enum CreateMutexError {
        BadParam,
        BadState,
        AllocationFailed,
    }
}

define_error! {
    /// Error type for mutex deletion.
    pub enum DeleteMutexError {
        Null,
        BadState,
    }
}

define_error! {
    /// Error type for locking a mutex.
    pub enum LockMutexError {
        Null,
        BadState,
        Timeout,
        Recursive,
        ObjectDeleted,
    }
}

define_error! {
    /// Error type for unlocking a mutex.
    pub enum UnlockMutexError {
        Null,
        BadState,
        NotOwner,
    }
}

define_error! {
    /// Error type for mutex state queries.
    pub enum QueryMutexError {
        Null,
        BadState,
    }
}
