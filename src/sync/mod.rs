mod atomic_int;

pub(crate) use atomic_int::*;
