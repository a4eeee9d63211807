//! Request, response and trailer rewriting.
pub mod builder;
pub mod chain;
pub mod context;
pub mod forwarded;
pub mod headers;
pub mod path;

pub use builder::{
    TransformBuildError, TransformBuilder, TransformBuilderContext,
    TransformClusterValidationContext, TransformFactory, TransformProvider,
    TransformRouteValidationContext,
};
pub use chain::{
    RequestTransform, ResponseCondition, ResponseTrailersTransform, ResponseTransform,
    TransformChain, TransformError,
};
pub use context::{
    QueryTransformContext, RequestTransformContext, ResponseTrailersTransformContext,
    ResponseTransformContext,
};
pub use forwarded::{ForwardedAction, ForwardedTransform, NodeFormat, XForwardedKind};
