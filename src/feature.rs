//! # Feature composition
//!
//! A peripheral is configured by applying an ordered set of [`Feature`]s to a
//! default initialised descriptor and committing the result to the register
//! block once, through the block's [`Peripheral::commit`] entry point.
//!
//! Feature sets are usually tuples. They are resolved at compile time and
//! every `apply` call is inlined, so a tuple of features costs the same as
//! writing the descriptor fields by hand:
//!
//! ```rust, ignore
//! let adc = Adc::new(dp.ADC1, (
//!     ClockPrescaler(AdcPrescaler::Div4),
//!     RegularChannels::new(&[0, 1, 2], SampleTime::T_71),
//!     ScanMode,
//! ))?;
//! ```
//!
//! When the set is only known at run time, a slice of `&dyn Feature<_>` works
//! the same way.
//!
//! ## Ordering
//!
//! Features are applied left to right. If two features write the same
//! descriptor field the later one wins. Features do not guard against this;
//! picking a sensible order is up to the caller. Features touching disjoint
//! fields commute.

use crate::Error;

/// A composable piece of peripheral configuration
pub trait Feature<D> {
    /// Writes this feature's part of the descriptor
    fn apply(&self, cfg: &mut D) -> Result<(), Error>;
}

/// A register block that can be configured from a descriptor
pub trait Peripheral {
    type Config: Default;

    /// Writes `cfg` to the hardware.
    ///
    /// Called once per (re)configuration with the fully composed descriptor.
    /// Implementations latch their own failures, with the native status the
    /// hardware reported.
    fn commit(&mut self, cfg: &Self::Config) -> Result<(), Error>;
}

/// Builds a descriptor from its default value and `features`
pub fn compose<D, F>(features: &F) -> Result<D, Error>
where
    D: Default,
    F: Feature<D> + ?Sized,
{
    let mut cfg = D::default();
    features.apply(&mut cfg)?;
    Ok(cfg)
}

/// Composes a descriptor and commits it to `periph`.
///
/// Nothing is written to the hardware if one of the features fails.
pub fn configure<P, F>(periph: &mut P, features: &F) -> Result<P::Config, Error>
where
    P: Peripheral,
    F: Feature<P::Config> + ?Sized,
{
    let cfg = compose(features)?;
    periph.commit(&cfg)?;
    Ok(cfg)
}

impl<D> Feature<D> for () {
    #[inline(always)]
    fn apply(&self, _cfg: &mut D) -> Result<(), Error> {
        Ok(())
    }
}

impl<D, F> Feature<D> for &F
where
    F: Feature<D> + ?Sized,
{
    #[inline(always)]
    fn apply(&self, cfg: &mut D) -> Result<(), Error> {
        (**self).apply(cfg)
    }
}

impl<'a, D> Feature<D> for [&'a dyn Feature<D>] {
    fn apply(&self, cfg: &mut D) -> Result<(), Error> {
        for f in self {
            f.apply(cfg)?;
        }
        Ok(())
    }
}

impl<'a, D, const N: usize> Feature<D> for [&'a dyn Feature<D>; N] {
    fn apply(&self, cfg: &mut D) -> Result<(), Error> {
        self[..].apply(cfg)
    }
}

macro_rules! feature_tuple {
    ($($F:ident),+) => {
        impl<D, $($F),+> Feature<D> for ($($F,)+)
        where
            $($F: Feature<D>),+
        {
            #[inline(always)]
            #[allow(non_snake_case)]
            fn apply(&self, cfg: &mut D) -> Result<(), Error> {
                let ($($F,)+) = self;
                $(
                    $F.apply(cfg)?;
                )+
                Ok(())
            }
        }
    };
}

feature_tuple!(A);
feature_tuple!(A, B);
feature_tuple!(A, B, C);
feature_tuple!(A, B, C, E);
feature_tuple!(A, B, C, E, F);
feature_tuple!(A, B, C, E, F, G);
feature_tuple!(A, B, C, E, F, G, H);
feature_tuple!(A, B, C, E, F, G, H, I);
feature_tuple!(A, B, C, E, F, G, H, I, J);
feature_tuple!(A, B, C, E, F, G, H, I, J, K);
feature_tuple!(A, B, C, E, F, G, H, I, J, K, L);
feature_tuple!(A, B, C, E, F, G, H, I, J, K, L, M);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq, Clone)]
    struct Desc {
        a: u8,
        b: bool,
        log: heapless::Vec<u8, 8>,
    }

    struct SetA(u8);
    impl Feature<Desc> for SetA {
        fn apply(&self, cfg: &mut Desc) -> Result<(), Error> {
            cfg.a = self.0;
            Ok(())
        }
    }

    struct SetB;
    impl Feature<Desc> for SetB {
        fn apply(&self, cfg: &mut Desc) -> Result<(), Error> {
            cfg.b = true;
            Ok(())
        }
    }

    struct Push(u8);
    impl Feature<Desc> for Push {
        fn apply(&self, cfg: &mut Desc) -> Result<(), Error> {
            cfg.log.push(self.0).map_err(|_| Error::CapacityExceeded)
        }
    }

    struct Fail;
    impl Feature<Desc> for Fail {
        fn apply(&self, _cfg: &mut Desc) -> Result<(), Error> {
            Err(Error::CapacityExceeded)
        }
    }

    #[derive(Default)]
    struct Block {
        commits: heapless::Vec<Desc, 4>,
    }

    impl Peripheral for Block {
        type Config = Desc;
        fn commit(&mut self, cfg: &Desc) -> Result<(), Error> {
            self.commits.push(cfg.clone()).ok();
            Ok(())
        }
    }

    #[test]
    fn disjoint_features_commute() {
        let ab: Desc = compose(&(SetA(5), SetB)).unwrap();
        let ba: Desc = compose(&(SetB, SetA(5))).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn later_feature_wins() {
        let d: Desc = compose(&(SetA(1), SetB, SetA(9))).unwrap();
        assert_eq!(d.a, 9);
        let d: Desc = compose(&(SetA(9), SetA(1))).unwrap();
        assert_eq!(d.a, 1);
    }

    #[test]
    fn applied_in_list_order() {
        let d: Desc = compose(&(Push(3), Push(1), Push(2))).unwrap();
        assert_eq!(&d.log[..], &[3, 1, 2]);
    }

    #[test]
    fn dynamic_list_matches_tuple() {
        let list: [&dyn Feature<Desc>; 3] = [&Push(1), &SetA(4), &Push(2)];
        let dynamic: Desc = compose(&list).unwrap();
        let fixed: Desc = compose(&(Push(1), SetA(4), Push(2))).unwrap();
        assert_eq!(dynamic, fixed);

        let slice: &[&dyn Feature<Desc>] = &list[..];
        assert_eq!(compose::<Desc, _>(slice).unwrap(), fixed);
    }

    #[test]
    fn configure_commits_once() {
        let mut block = Block::default();
        let cfg = configure(&mut block, &(SetA(2), SetB)).unwrap();
        assert_eq!(block.commits.len(), 1);
        assert_eq!(block.commits[0], cfg);

        // Same features, same order, same descriptor.
        let again = configure(&mut block, &(SetA(2), SetB)).unwrap();
        assert_eq!(again, cfg);
        assert_eq!(block.commits[0], block.commits[1]);
    }

    #[test]
    fn failing_feature_prevents_commit() {
        let mut block = Block::default();
        assert_eq!(
            configure(&mut block, &(SetA(2), Fail, SetB)),
            Err(Error::CapacityExceeded)
        );
        assert!(block.commits.is_empty());
    }

    #[test]
    fn empty_set_is_default() {
        let d: Desc = compose(&()).unwrap();
        assert_eq!(d, Desc::default());
    }
}
