//! Helper macro for exported functions.

/// Generate a `#[unsafe(no_mangle)] pub unsafe extern "C-unwind" fn` export.
///
/// ```ignore
/// abi_fn! {
///     /// Doc comment.
///     fn uthread_thing(arg: c_int) -> c_int {
///         body
///     }
/// }
/// ```
///
/// The body runs inside an `unsafe` block; each pointer dereference still
/// carries its own `SAFETY` note.
macro_rules! abi_fn {
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty
        $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        #[allow(unused_unsafe)]
        pub unsafe extern "C-unwind" fn $name( $($arg : $argty),* ) -> $ret {
            unsafe { $body }
        }
    };
}
