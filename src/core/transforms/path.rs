use crate::{
    config::models::TransformValues,
    core::transforms::{
        builder::{
            Contribution, TransformBuildError, TransformBuilderContext, TransformFactory,
            TransformRouteValidationContext, check_parameter_count,
        },
        chain::RequestTransform,
    },
};

const PATH_PREFIX: &str = "PathPrefix";
const PATH_REMOVE_PREFIX: &str = "PathRemovePrefix";
const PATH_SET: &str = "PathSet";
const QUERY_VALUE_PARAMETER: &str = "QueryValueParameter";
const QUERY_REMOVE_PARAMETER: &str = "QueryRemoveParameter";
const SET: &str = "Set";
const APPEND: &str = "Append";

/// Claims `PathPrefix`, `PathRemovePrefix` and `PathSet`
#[derive(Debug, Default, Clone, Copy)]
pub struct PathTransformFactory;

impl PathTransformFactory {
    fn parse(
        &self,
        values: &TransformValues,
    ) -> Option<Result<Vec<Contribution>, TransformBuildError>> {
        let (key, make): (&str, fn(String) -> RequestTransform) =
            if values.contains_key(PATH_PREFIX) {
                (PATH_PREFIX, RequestTransform::PathPrefix)
            } else if values.contains_key(PATH_REMOVE_PREFIX) {
                (PATH_REMOVE_PREFIX, RequestTransform::PathRemovePrefix)
            } else if values.contains_key(PATH_SET) {
                (PATH_SET, RequestTransform::PathSet)
            } else {
                return None;
            };

        let raw = values.get(key).unwrap_or_default();
        Some(
            check_parameter_count(values, 1)
                .and_then(|_| parse_path(key, raw))
                .map(|path| vec![Contribution::Request(make(path))]),
        )
    }
}

impl TransformFactory for PathTransformFactory {
    fn validate(
        &self,
        context: &mut TransformRouteValidationContext<'_>,
        values: &TransformValues,
    ) -> bool {
        context.check(self.parse(values))
    }

    fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool {
        context.contribute(self.parse(values))
    }
}

fn parse_path(key: &str, raw: &str) -> Result<String, TransformBuildError> {
    if raw.is_empty() || raw.starts_with('/') {
        Ok(raw.to_string())
    } else {
        Err(TransformBuildError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected: "The path must be empty or start with '/'".to_string(),
        })
    }
}

/// Claims `QueryValueParameter` and `QueryRemoveParameter`
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryTransformFactory;

impl QueryTransformFactory {
    fn parse(
        &self,
        values: &TransformValues,
    ) -> Option<Result<Vec<Contribution>, TransformBuildError>> {
        if let Some(key) = values.get(QUERY_VALUE_PARAMETER) {
            return Some(query_value(values, key));
        }
        if let Some(key) = values.get(QUERY_REMOVE_PARAMETER) {
            return Some(
                check_parameter_count(values, 1)
                    .and_then(|_| non_empty_key(QUERY_REMOVE_PARAMETER, key))
                    .map(|key| vec![Contribution::Request(RequestTransform::QueryRemove(key))]),
            );
        }
        None
    }
}

impl TransformFactory for QueryTransformFactory {
    fn validate(
        &self,
        context: &mut TransformRouteValidationContext<'_>,
        values: &TransformValues,
    ) -> bool {
        context.check(self.parse(values))
    }

    fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool {
        context.contribute(self.parse(values))
    }
}

fn query_value(values: &TransformValues, key: &str) -> Result<Vec<Contribution>, TransformBuildError> {
    check_parameter_count(values, 2)?;
    let key = non_empty_key(QUERY_VALUE_PARAMETER, key)?;
    let (value, append) = if let Some(value) = values.get(SET) {
        (value, false)
    } else if let Some(value) = values.get(APPEND) {
        (value, true)
    } else {
        return Err(TransformBuildError::UnexpectedParameters {
            transform: QUERY_VALUE_PARAMETER.to_string(),
            keys: values.keys().collect::<Vec<_>>().join(";"),
            expected: "'Set' or 'Append'".to_string(),
        });
    };

    Ok(vec![Contribution::Request(RequestTransform::QueryValue {
        key,
        value: value.to_string(),
        append,
    })])
}

fn non_empty_key(transform: &str, key: &str) -> Result<String, TransformBuildError> {
    if key.is_empty() {
        Err(TransformBuildError::InvalidValue {
            key: transform.to_string(),
            value: key.to_string(),
            expected: "A query parameter name is required".to_string(),
        })
    } else {
        Ok(key.to_string())
    }
}
