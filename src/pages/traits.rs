/// Types that live inside a page buffer as a flat byte image.
pub trait Serialize: Sized {
    fn as_bytes(&self) -> &[u8];
    fn from_bytes(bytes: &[u8]) -> Self;
}
