//! Per-protocol metadata cache: two independent slots, written at startup
//! from disk and overwritten by keygen admission and sign-init loads.

use std::sync::RwLock;

use crate::error::TssError;
use crate::models::{MetaData, Protocol};

#[derive(Debug, Default)]
pub struct MetaCache {
    eddsa: RwLock<Option<MetaData>>,
    ecdsa: RwLock<Option<MetaData>>,
}

impl MetaCache {
    pub fn new() -> Self {
        MetaCache::default()
    }

    fn slot(&self, protocol: Protocol) -> &RwLock<Option<MetaData>> {
        match protocol {
            Protocol::Eddsa => &self.eddsa,
            Protocol::Ecdsa => &self.ecdsa,
        }
    }

    pub fn set(&self, protocol: Protocol, meta: MetaData) {
        *self.slot(protocol).write().expect("meta cache poisoned") = Some(meta);
    }

    pub fn get(&self, protocol: Protocol) -> Result<MetaData, TssError> {
        let slot = self.slot(protocol).read().expect("meta cache poisoned");
        (*slot).ok_or_else(|| TssError::no_meta_data(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_independent() {
        let cache = MetaCache::new();
        assert!(matches!(
            cache.get(Protocol::Eddsa),
            Err(TssError::EddsaNoMetaDataFound)
        ));

        cache.set(
            Protocol::Eddsa,
            MetaData {
                peers_count: 3,
                threshold: 2,
            },
        );
        assert_eq!(cache.get(Protocol::Eddsa).unwrap().threshold, 2);
        assert!(matches!(
            cache.get(Protocol::Ecdsa),
            Err(TssError::EcdsaNoMetaDataFound)
        ));

        cache.set(
            Protocol::Ecdsa,
            MetaData {
                peers_count: 5,
                threshold: 3,
            },
        );
        assert_eq!(cache.get(Protocol::Ecdsa).unwrap().peers_count, 5);
    }
}
