//! Rendering of per-attendee terraform files.

use super::classify::InfraError;
use super::AttendeeSpec;
use labs_core::validate_identifier;
use std::path::PathBuf;
use tera::{Context, Tera};

/// Template shipped with the orchestrator.
pub const BUILTIN_TEMPLATE: &str = "ovh-public-cloud";

const TEMPLATE_EXTENSION: &str = "tf.tera";

const OVH_PUBLIC_CLOUD: &str = r#"terraform {
  required_providers {
    ovh = {
      source = "ovh/ovh"
    }
  }
}

# Credentials come from OVH_APPLICATION_KEY, OVH_APPLICATION_SECRET and
# OVH_CONSUMER_KEY in the environment.
provider "ovh" {
  endpoint = "ovh-eu"
}

variable "project_description" {
  type = string
}

variable "username" {
  type = string
}

variable "user_email" {
  type = string
}

variable "user_password" {
  type      = string
  sensitive = true
}

data "ovh_me" "myaccount" {}

data "ovh_order_cart" "mycart" {
  ovh_subsidiary = data.ovh_me.myaccount.ovh_subsidiary
}

data "ovh_order_cart_product_plan" "cloud" {
  cart_id        = data.ovh_order_cart.mycart.id
  price_capacity = "renew"
  product        = "cloud"
  plan_code      = "project.2018"
}

resource "ovh_cloud_project" "workshop_project" {
  ovh_subsidiary = data.ovh_order_cart.mycart.ovh_subsidiary
  description    = var.project_description

  plan {
    duration     = data.ovh_order_cart_product_plan.cloud.selected_price.0.duration
    plan_code    = data.ovh_order_cart_product_plan.cloud.plan_code
    pricing_mode = data.ovh_order_cart_product_plan.cloud.selected_price.0.pricing_mode
  }
}

resource "ovh_me_identity_user" "workshop_user" {
  description = var.username
  email       = var.user_email
  group       = "UNPRIVILEGED"
  login       = var.username
  password    = var.user_password
}

resource "ovh_iam_policy" "workshop_policy" {
  name        = "access-grant-for-pci-project-{{ identifier }}"
  description = "Grants access to ${var.username} for PCI project ${ovh_cloud_project.workshop_project.project_id}"
  identities  = [ovh_me_identity_user.workshop_user.urn]
  resources   = [ovh_cloud_project.workshop_project.urn]
  allow       = ["*"]
}

output "project_id" {
  value = ovh_cloud_project.workshop_project.project_id
}

output "project_urn" {
  value = ovh_cloud_project.workshop_project.urn
}

output "user_urn" {
  value = ovh_me_identity_user.workshop_user.urn
}

output "username" {
  value = ovh_me_identity_user.workshop_user.login
}

output "password" {
  value     = ovh_me_identity_user.workshop_user.password
  sensitive = true
}
"#;

const TFVARS: &str = r#"project_description = "{{ project_description }}"
username            = "{{ identifier }}"
user_email          = "{{ email }}"
user_password       = "{{ password }}"
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFiles {
    pub main_tf: String,
    pub tfvars: String,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates_dir: Option<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(templates_dir: Option<PathBuf>) -> Self {
        Self { templates_dir }
    }

    /// Operator templates in `templates_dir` shadow the built-in one.
    fn source(&self, name: &str) -> Result<String, InfraError> {
        validate_identifier(name)
            .map_err(|_| InfraError::permanent(format!("invalid template name '{}'", name)))?;

        if let Some(dir) = &self.templates_dir {
            let path = dir.join(format!("{}.{}", name, TEMPLATE_EXTENSION));
            if path.is_file() {
                return Ok(std::fs::read_to_string(&path)?);
            }
        }

        if name == BUILTIN_TEMPLATE {
            return Ok(OVH_PUBLIC_CLOUD.to_string());
        }

        Err(InfraError::permanent(format!("unknown template '{}'", name)))
    }

    pub fn render(&self, spec: &AttendeeSpec, password: &str) -> Result<RenderedFiles, InfraError> {
        let mut tera = Tera::default();
        tera.add_raw_template("main.tf", &self.source(&spec.template)?)
            .map_err(template_error)?;
        tera.add_raw_template("terraform.tfvars", TFVARS)
            .map_err(template_error)?;

        let mut context = Context::new();
        context.insert("identifier", &spec.identifier);
        context.insert("email", &hcl_escape(&spec.email));
        context.insert("workshop_name", &hcl_escape(&spec.workshop_name));
        context.insert(
            "project_description",
            &hcl_escape(&format!("TechLabs {} ({})", spec.workshop_name, spec.identifier)),
        );
        context.insert("password", &hcl_escape(password));

        Ok(RenderedFiles {
            main_tf: tera.render("main.tf", &context).map_err(template_error)?,
            tfvars: tera
                .render("terraform.tfvars", &context)
                .map_err(template_error)?,
        })
    }
}

fn template_error(err: tera::Error) -> InfraError {
    InfraError::permanent(format!("template rendering failed: {}", err))
}

/// Escape a value for use inside an HCL double-quoted string.
fn hcl_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace("${", "$${")
        .replace("%{", "%%{")
}
