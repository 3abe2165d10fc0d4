//! `dynconf validate`: check a desired-state file without touching HAProxy.
//!
//! The report follows the file's layout: one section each for blueprints,
//! routes and endpoints, listing what was declared and the problems found
//! in it. Text goes to stdout for a valid file and to stderr otherwise.

use serde::Serialize;

use crate::cli::{ValidateArgs, ValidateFormat};
use crate::config::model::{service_key, DesiredState};
use crate::config::sources::parse_config_str;
use crate::config::validation;
use crate::error::{DynconfError, ValidationError};
use crate::manager::blueprint::POOL_SIZE_ANNOTATION;

#[derive(Debug, Default, Serialize)]
struct Section {
    items: Vec<serde_json::Value>,
    errors: Vec<serde_json::Value>,
    #[serde(skip)]
    lines: Vec<String>,
    #[serde(skip)]
    problems: Vec<String>,
}

impl Section {
    fn add(&mut self, line: String, item: serde_json::Value) {
        self.lines.push(line);
        self.items.push(item);
    }

    fn reject(&mut self, error: &ValidationError) {
        let problem = format!("{}: {}: {}", error.route, error.field, error.message);
        self.problems.push(match &error.suggestion {
            Some(suggestion) => format!("{problem} ({suggestion})"),
            None => problem,
        });
        self.errors.push(serde_json::json!({
            "label": error.route,
            "field": error.field,
            "message": error.message,
            "suggestion": error.suggestion,
        }));
    }

    fn render(&self, title: &str, out: &mut Vec<String>) {
        out.push(format!("{title} ({})", self.lines.len()));
        out.extend(self.lines.iter().map(|l| format!("  {l}")));
        out.extend(self.problems.iter().map(|p| format!("  \u{2717} {p}")));
    }
}

#[derive(Debug, Serialize)]
struct Report {
    valid: bool,
    blueprints: Section,
    routes: Section,
    endpoints: Section,
}

impl Report {
    fn new(state: &DesiredState, errors: &[ValidationError]) -> Self {
        let mut report = Self {
            valid: errors.is_empty(),
            blueprints: Section::default(),
            routes: Section::default(),
            endpoints: Section::default(),
        };

        for blueprint in &state.blueprints {
            let termination = blueprint.termination().map_or("http", |t| t.as_str());
            let pool_size = blueprint
                .annotations
                .get(POOL_SIZE_ANNOTATION)
                .map_or("default", String::as_str);
            report.blueprints.add(
                format!("{}  ({termination})  pool: {pool_size}", blueprint.name),
                serde_json::json!({
                    "name": blueprint.name,
                    "termination": termination,
                    "pool_size": pool_size,
                }),
            );
        }

        for route in &state.routes {
            let termination = route.termination().map_or("http", |t| t.as_str());
            let service = if route.service.is_empty() { "none" } else { &route.service };
            let endpoints = state.endpoints_for(route).len();
            report.routes.add(
                format!(
                    "{}  {}{}  ({termination})  service: {service}  endpoints: {endpoints}",
                    route.id(),
                    route.host,
                    route.path,
                ),
                serde_json::json!({
                    "id": route.id(),
                    "host": route.host,
                    "path": route.path,
                    "termination": termination,
                    "service": route.service,
                    "endpoints": endpoints,
                }),
            );
        }

        for (key, endpoints) in &state.endpoints {
            let used_by: Vec<String> = state
                .routes
                .iter()
                .filter(|r| service_key(&r.namespace, &r.service) == *key)
                .map(|r| r.id())
                .collect();
            let routes = if used_by.is_empty() { "unused".to_string() } else { used_by.join(", ") };
            report.endpoints.add(
                format!("{key}  {} endpoints  routes: {routes}", endpoints.len()),
                serde_json::json!({
                    "service": key,
                    "endpoints": endpoints.len(),
                    "routes": used_by,
                }),
            );
        }

        for error in errors {
            report.section_for(error).reject(error);
        }
        report
    }

    /// Errors are labelled `blueprints[i]`, `endpoints[key]` or with the
    /// route they belong to.
    fn section_for(&mut self, error: &ValidationError) -> &mut Section {
        if error.route.starts_with("blueprints[") {
            &mut self.blueprints
        } else if error.route.starts_with("endpoints[") {
            &mut self.endpoints
        } else {
            &mut self.routes
        }
    }

    fn error_count(&self) -> usize {
        self.blueprints.errors.len() + self.routes.errors.len() + self.endpoints.errors.len()
    }

    fn to_text(&self, path: &str) -> String {
        let mut out = vec![if self.valid {
            format!("\u{2713} {path} is valid")
        } else {
            format!("\u{2717} {path} has {} errors", self.error_count())
        }];
        self.blueprints.render("blueprints", &mut out);
        self.routes.render("routes", &mut out);
        self.endpoints.render("endpoints", &mut out);
        out.join("\n")
    }
}

pub fn execute(args: &ValidateArgs) -> Result<(), DynconfError> {
    let path = &args.config;

    if !path.exists() {
        return Err(DynconfError::ConfigFileNotFound { path: path.clone() });
    }

    let content = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let state = parse_config_str(ext, &content, &path.display().to_string())?;

    let errors = validation::validate(&state).err().unwrap_or_default();
    let report = Report::new(&state, &errors);

    match args.format {
        ValidateFormat::Text if report.valid => println!("{}", report.to_text(&path.display().to_string())),
        ValidateFormat::Text => eprintln!("{}", report.to_text(&path.display().to_string())),
        ValidateFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(DynconfError::ConfigValidation { errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Endpoint, RouteSpec, Termination, TlsConfig};

    fn state() -> DesiredState {
        let mut blueprint = RouteSpec::new("openshift", "blueprint-edge");
        blueprint.tls = Some(TlsConfig::new(Termination::Edge));
        blueprint
            .annotations
            .insert(POOL_SIZE_ANNOTATION.into(), "4".into());

        let mut route = RouteSpec::new("shop", "web");
        route.host = "shop.example.com".into();
        route.service = "web".into();

        let mut state = DesiredState {
            blueprints: vec![blueprint],
            routes: vec![route],
            ..DesiredState::default()
        };
        state.endpoints.insert(
            "shop/web".into(),
            vec![Endpoint {
                id: "web-1".into(),
                ip: "10.128.0.11".into(),
                port: 8080,
                app_protocol: None,
            }],
        );
        state.endpoints.insert("shop/idle".into(), Vec::new());
        state
    }

    #[test]
    fn text_report_has_a_section_per_kind() {
        let report = Report::new(&state(), &[]);
        let text = report.to_text("dynconf.yaml");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "\u{2713} dynconf.yaml is valid");
        assert_eq!(lines[1], "blueprints (1)");
        assert_eq!(lines[2], "  blueprint-edge  (edge)  pool: 4");
        assert_eq!(lines[3], "routes (1)");
        assert_eq!(
            lines[4],
            "  shop:web  shop.example.com  (http)  service: web  endpoints: 1"
        );
        assert_eq!(lines[5], "endpoints (2)");
        assert!(lines.contains(&"  shop/web  1 endpoints  routes: shop:web"));
        assert!(lines.contains(&"  shop/idle  0 endpoints  routes: unused"));
    }

    #[test]
    fn errors_land_in_their_section() {
        let mut invalid = state();
        invalid.routes[0].host = "Shop.example.com".into();
        invalid.blueprints[0]
            .annotations
            .insert(POOL_SIZE_ANNOTATION.into(), "zero".into());
        invalid.endpoints.get_mut("shop/web").unwrap()[0].ip = "nowhere".into();
        let errors = validation::validate(&invalid).unwrap_err();

        let report = Report::new(&invalid, &errors);
        assert!(!report.valid);
        assert_eq!(report.blueprints.errors.len(), 1);
        assert_eq!(report.routes.errors.len(), 1);
        assert_eq!(report.endpoints.errors.len(), 1);
        assert_eq!(report.error_count(), errors.len());

        let text = report.to_text("dynconf.yaml");
        assert!(text.starts_with("\u{2717} dynconf.yaml has 3 errors"));
        assert!(text.contains("did you mean 'shop.example.com'?"));
    }

    #[test]
    fn json_report_is_keyed_by_section() {
        let report = Report::new(&state(), &[]);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["valid"], true);
        assert_eq!(json["blueprints"]["items"][0]["pool_size"], "4");
        assert_eq!(json["routes"]["items"][0]["id"], "shop:web");
        assert_eq!(json["endpoints"]["items"].as_array().unwrap().len(), 2);
        assert!(json["routes"]["errors"].as_array().unwrap().is_empty());
        assert!(json["routes"].get("lines").is_none());
    }
}
