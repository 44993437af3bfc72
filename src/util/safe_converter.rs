/// Widening casts that can never lose information on the supported targets.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
