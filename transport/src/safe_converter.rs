pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u8 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: Values outside the range are saturated in release builds and trip an assertion in debug builds
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        debug_assert!(self <= u32::MAX as usize, "application logic should have ensured the value range");
        self.min(u32::MAX as usize) as u32
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        debug_assert!(self <= u16::MAX as usize, "application logic should have ensured the value range");
        self.min(u16::MAX as usize) as u16
    }
}
impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        debug_assert!(self <= u32::MAX as u64, "application logic should have ensured the value range");
        self.min(u32::MAX as u64) as u32
    }
}
