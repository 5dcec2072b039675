use futures::future::BoxFuture;

pub type DynFuture<'a, T> = BoxFuture<'a, T>;
