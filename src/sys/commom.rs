//! Tiny conversion traits used to keep platform-specific representations
//! (e.g. `libc::sockaddr_in`) out of the public socket API.

pub trait AsInner<Inner: ?Sized> {
    fn as_inner(&self) -> &Inner;
}

pub trait IntoInner<Inner> {
    fn into_inner(self) -> Inner;
}

pub trait FromInner<Inner> {
    fn from_inner(inner: Inner) -> Self;
}
