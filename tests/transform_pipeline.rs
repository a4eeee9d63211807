// Integration tests for transform chain construction and forwarding client reuse
mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{HeaderValue, Request, header};
    use waypoint::{
        ForwardingClientContext, ForwardingClientFactory, HttpClient, TransformBuilder,
        config::models::{
            DestinationConfig, HttpClientConfig, RouteConfig, SslProtocol, TransformValues,
        },
        core::{
            DestinationModel,
            transforms::{ForwardedAction, RequestTransform, XForwardedKind},
        },
    };

    use crate::common::connection;

    fn build(transforms: Vec<TransformValues>) -> waypoint::TransformChain {
        let mut route = RouteConfig::new("route1").with_cluster("cluster1");
        for t in transforms {
            route = route.with_transform(t);
        }
        TransformBuilder::new().build(&route, None).unwrap()
    }

    fn inbound(host: &str) -> http::request::Parts {
        let (parts, ()) = Request::builder()
            .uri("/path")
            .header(header::HOST, host)
            .header("x-custom", "1")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn destination(host: Option<&str>) -> DestinationModel {
        let config = DestinationConfig::new("http://d1.internal:8080");
        DestinationModel::new(match host {
            Some(host) => config.with_host(host),
            None => config,
        })
    }

    fn outbound_host(
        chain: &waypoint::TransformChain,
        destination: &DestinationModel,
    ) -> Option<HeaderValue> {
        let proxy_request = chain
            .transform_request(
                &inbound("client.example"),
                &connection(false),
                Some(destination),
                destination.address(),
            )
            .unwrap();
        proxy_request.headers.get(header::HOST).cloned()
    }

    #[test]
    fn test_empty_route_gets_default_transforms() {
        let chain = build(Vec::new());

        assert_eq!(chain.request_transforms().len(), 6);
        assert!(chain.response_transforms().is_empty());
        assert!(chain.response_trailers_transforms().is_empty());
        assert!(matches!(
            chain.request_transforms()[0],
            RequestTransform::OriginalHost(false)
        ));
        assert!(matches!(
            chain.request_transforms()[1],
            RequestTransform::XForwarded {
                kind: XForwardedKind::For,
                action: ForwardedAction::Set,
                ..
            }
        ));
    }

    #[test]
    fn test_forwarded_alone_when_x_forwarded_is_off() {
        let chain = build(vec![
            TransformValues::new().with("X-Forwarded", "Off"),
            TransformValues::new().with("Forwarded", "proto"),
        ]);

        assert_eq!(chain.request_transforms().len(), 1);
        let RequestTransform::Forwarded(forwarded) = &chain.request_transforms()[0] else {
            panic!("Expected the Forwarded transform");
        };
        assert!(forwarded.proto);
        assert!(!forwarded.host);

        let proxy_request = chain
            .transform_request(
                &inbound("client.example"),
                &connection(true),
                None,
                "http://d1.internal:8080",
            )
            .unwrap();
        assert_eq!(proxy_request.headers["forwarded"], "proto=https");
    }

    #[test]
    fn test_host_resolution() {
        let original = build(vec![
            TransformValues::new().with("RequestHeaderOriginalHost", "true"),
        ]);
        assert_eq!(
            outbound_host(&original, &destination(Some("d1-host"))).unwrap(),
            "client.example"
        );

        let original_without_copy = build(vec![
            TransformValues::new().with("RequestHeaderOriginalHost", "true"),
            TransformValues::new().with("RequestHeadersCopy", "false"),
        ]);
        assert_eq!(
            outbound_host(&original_without_copy, &destination(Some("d1-host"))).unwrap(),
            "client.example"
        );

        let defaults = build(Vec::new());
        assert_eq!(
            outbound_host(&defaults, &destination(Some("d1-host"))).unwrap(),
            "d1-host"
        );
        assert_eq!(outbound_host(&defaults, &destination(None)), None);
    }

    #[test]
    fn test_header_copy_can_be_disabled() {
        let chain = build(vec![
            TransformValues::new().with("RequestHeadersCopy", "false"),
        ]);

        let proxy_request = chain
            .transform_request(
                &inbound("client.example"),
                &connection(false),
                None,
                "http://d1.internal:8080",
            )
            .unwrap();
        assert!(!proxy_request.headers.contains_key("x-custom"));
        assert_eq!(proxy_request.headers["x-forwarded-for"], "10.0.0.1");
        assert_eq!(proxy_request.uri, "http://d1.internal:8080/path");
    }

    #[test]
    fn test_validation_reports_every_error() {
        let route = RouteConfig::new("route1")
            .with_transform(TransformValues::new().with("Foo", "1"))
            .with_transform(TransformValues::new().with("PathPrefix", "no-slash"));

        let builder = TransformBuilder::new();
        let errors = builder.validate_route(&route);
        assert_eq!(errors.len(), 2);
        assert_eq!(builder.build(&route, None).unwrap_err(), errors[0]);
    }

    #[tokio::test]
    async fn test_forwarding_client_is_reused_for_equal_config() {
        let factory = ForwardingClientFactory::new();
        let config = HttpClientConfig {
            max_connections_per_server: Some(10),
            ssl_protocols: Some(vec![SslProtocol::Tls12, SslProtocol::Tls13]),
            ..HttpClientConfig::default()
        };

        let first = factory
            .create_client(ForwardingClientContext {
                cluster_id: "cluster1",
                old_config: None,
                old_client: None,
                new_config: Some(&config),
            })
            .unwrap();

        let same = config.clone();
        let reused = factory
            .create_client(ForwardingClientContext {
                cluster_id: "cluster1",
                old_config: Some(&config),
                old_client: Some(first.clone()),
                new_config: Some(&same),
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &reused));

        let changed = HttpClientConfig {
            dangerous_accept_any_server_certificate: Some(true),
            ..config.clone()
        };
        let rebuilt: Arc<dyn HttpClient> = factory
            .create_client(ForwardingClientContext {
                cluster_id: "cluster1",
                old_config: Some(&config),
                old_client: Some(first.clone()),
                new_config: Some(&changed),
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[tokio::test]
    async fn test_missing_config_equals_default_config() {
        let factory = ForwardingClientFactory::new();
        let default_config = HttpClientConfig::default();
        let first = factory
            .create_client(ForwardingClientContext {
                cluster_id: "cluster1",
                old_config: None,
                old_client: None,
                new_config: None,
            })
            .unwrap();

        let reused = factory
            .create_client(ForwardingClientContext {
                cluster_id: "cluster1",
                old_config: None,
                old_client: Some(first.clone()),
                new_config: Some(&default_config),
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &reused));
    }
}
