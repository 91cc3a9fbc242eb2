use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Wrapper around an atomic integer type (via `AtomicIntTrait`) that supports
/// transparently converting to/from a specific type.
#[derive(Debug)]
pub(crate) struct AtomicInt<I, T>
where
    I: AtomicIntTrait,
{
    atom: I::Atomic,
    _phantom: PhantomData<T>,
}

impl<I, T> AtomicInt<I, T>
where
    I: AtomicIntTrait + Copy,
    T: From<I> + Into<I>,
{
    pub(crate) fn new(val: T) -> Self {
        Self {
            atom: <I as AtomicIntTrait>::new(val.into()),
            _phantom: PhantomData,
        }
    }

    pub(crate) fn load(&self) -> T {
        let val = <I as AtomicIntTrait>::load(&self.atom, Ordering::Acquire);
        T::from(val)
    }

    pub(crate) fn store(&self, val: T) {
        <I as AtomicIntTrait>::store(&self.atom, val.into(), Ordering::Release);
    }

    pub(crate) fn swap(&self, val: T) -> T {
        let old_val = <I as AtomicIntTrait>::swap(&self.atom, val.into(), Ordering::AcqRel);
        T::from(old_val)
    }

    pub(crate) fn compare_exchange(&self, current: T, new: T) -> Result<T, T> {
        <I as AtomicIntTrait>::compare_exchange(
            &self.atom,
            current.into(),
            new.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(T::from)
        .map_err(T::from)
    }
}

pub(crate) trait AtomicIntTrait {
    type Atomic;

    fn new(val: Self) -> Self::Atomic;
    fn load(atom: &Self::Atomic, order: Ordering) -> Self;
    fn store(atom: &Self::Atomic, val: Self, order: Ordering);
    fn swap(atom: &Self::Atomic, val: Self, order: Ordering) -> Self;
    fn compare_exchange(
        atom: &Self::Atomic,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>
    where
        Self: Sized;
}

macro_rules! atomic_int_trait_impl {
    ($type:ty, $atom:ty) => {
        impl AtomicIntTrait for $type {
            type Atomic = $atom;

            fn new(val: Self) -> Self::Atomic {
                Self::Atomic::new(val)
            }

            fn load(atom: &Self::Atomic, order: Ordering) -> Self {
                atom.load(order)
            }

            fn store(atom: &Self::Atomic, val: Self, order: Ordering) {
                atom.store(val, order);
            }

            fn swap(atom: &Self::Atomic, val: Self, order: Ordering) -> Self {
                atom.swap(val, order)
            }

            fn compare_exchange(
                atom: &Self::Atomic,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                atom.compare_exchange(current, new, success, failure)
            }
        }
    };
}

atomic_int_trait_impl!(u8, AtomicU8);

/// Wrapper around `AtomicInt` that allows fallible conversion, which is super
/// useful for enums.
#[derive(Debug)]
pub(crate) struct AtomicEnum<I, T>
where
    I: AtomicIntTrait,
    I::Atomic: fmt::Debug,
{
    int: AtomicInt<I, I>,
    _phantom: PhantomData<T>,
}

impl<I, T> AtomicEnum<I, T>
where
    I: AtomicIntTrait + fmt::Display + Copy,
    I::Atomic: fmt::Debug,
    T: TryFrom<I> + Into<I>,
{
    pub(crate) fn new(val: T) -> Self {
        Self {
            int: AtomicInt::new(val.into()),
            _phantom: PhantomData,
        }
    }

    fn convert_from_integer(val: I) -> T {
        T::try_from(val).map_or_else(
            |_| {
                panic!("ERROR: Invalid enum value {val}");
            },
            |enum_val| enum_val,
        )
    }

    pub(crate) fn load(&self) -> T {
        let val = self.int.load();
        Self::convert_from_integer(val)
    }

    pub(crate) fn store(&self, val: T) {
        self.int.store(val.into());
    }

    pub(crate) fn swap(&self, val: T) -> T {
        let old_val = self.int.swap(val.into());
        Self::convert_from_integer(old_val)
    }

    pub(crate) fn compare_exchange(&self, current: T, new: T) -> Result<T, T> {
        self.int
            .compare_exchange(current.into(), new.into())
            .map(Self::convert_from_integer)
            .map_err(Self::convert_from_integer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    #[repr(u8)]
    enum Color {
        Red,
        Green,
        Blue,
    }

    impl TryFrom<u8> for Color {
        type Error = ();

        fn try_from(value: u8) -> Result<Self, Self::Error> {
            match value {
                0 => Ok(Self::Red),
                1 => Ok(Self::Green),
                2 => Ok(Self::Blue),
                _ => Err(()),
            }
        }
    }

    impl From<Color> for u8 {
        fn from(value: Color) -> Self {
            value as Self
        }
    }

    #[test]
    fn load_store_swap() {
        let cell: AtomicEnum<u8, Color> = AtomicEnum::new(Color::Red);
        assert_eq!(cell.load(), Color::Red);
        cell.store(Color::Green);
        assert_eq!(cell.swap(Color::Blue), Color::Green);
        assert_eq!(cell.load(), Color::Blue);
    }

    #[test]
    fn compare_exchange_success_and_failure() {
        let cell: AtomicEnum<u8, Color> = AtomicEnum::new(Color::Red);
        assert_eq!(cell.compare_exchange(Color::Red, Color::Blue), Ok(Color::Red));
        assert_eq!(
            cell.compare_exchange(Color::Red, Color::Green),
            Err(Color::Blue)
        );
        assert_eq!(cell.load(), Color::Blue);
    }
}
