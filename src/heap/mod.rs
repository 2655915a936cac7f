pub(crate) mod backing;
pub(crate) mod block;
pub(crate) mod cache;
pub(crate) mod chunks;
pub(crate) mod freelist;
pub(crate) mod integration;
pub(crate) mod scope;
pub(crate) mod segregated;
pub(crate) mod slab;

pub mod adapter;
pub mod pool;
pub mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
