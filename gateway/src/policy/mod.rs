//! Claim-to-identity mapping and admission checks.
//!
//! A [`ClaimMapper`] is compiled once from the `oauth2` auth config. For every
//! verified token it
//!
//! 1. evaluates the declared variables in order, each one visible to the
//!    expressions after it,
//! 2. runs the validations in order and stops at the first one that does not
//!    hold,
//! 3. evaluates the impersonation expressions to the [`Identity`] the request
//!    will act as.
//!
//! The claims are available to every expression as `claims`.

use alloc::collections::BTreeSet;

use tracing::debug;

use crate::{
    config::{ImpersonationConfig, OAuth2Config},
    expr::{CompileError, Context, Expression, Value},
    identity::Identity,
};

/// Name under which the verified claims are exposed to expressions.
pub const CLAIMS: &str = "claims";

/// Claims of a verified ID token.
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// Why a user was not turned into an identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticationError {
    /// The session token failed verification and could not be refreshed.
    /// Raised by the authenticator; [`ClaimMapper::map`] only sees verified claims.
    #[error("token invalid: {0}")]
    TokenInvalid(String),
    /// Carries the failed validation's configured message.
    #[error("{0}")]
    ValidationFailed(String),
    #[error("impersonation mapping failed: {0}")]
    MappingFailed(String),
}

/// Problems found while compiling the policy at startup.
#[derive(Debug, thiserror::Error)]
pub enum PolicyConfigError {
    #[error("auth.variables: '{0}' is not a valid identifier")]
    InvalidName(String),
    #[error("auth.variables: 'claims' is reserved for the token claims")]
    ReservedName,
    #[error("auth.variables: '{0}' is declared more than once")]
    DuplicateName(String),
    #[error("{context}: {source}")]
    Compile {
        context: String,
        #[source]
        source: CompileError,
    },
    #[error("{context}: unknown identifier '{name}' (declare it in auth.variables before use)")]
    UnknownIdentifier { context: String, name: String },
    #[error("auth.impersonation.username must be configured")]
    MissingUsername,
}

#[derive(Debug)]
struct Validation {
    expression: Expression,
    message: String,
}

/// Compiled claim policy, shared read-only between requests.
#[derive(Debug)]
pub struct ClaimMapper {
    variables: Vec<(String, Expression)>,
    validations: Vec<Validation>,
    username: Expression,
    groups: Option<Expression>,
}

impl ClaimMapper {
    /// Compiles every expression of the `oauth2` configuration.
    ///
    /// # Errors
    ///
    /// Fails on invalid or duplicate variable names, expressions that do not
    /// compile, references to undeclared variables and a missing
    /// `impersonation.username` expression.
    pub fn from_config(cfg: &OAuth2Config) -> Result<Self, PolicyConfigError> {
        let mut declared = BTreeSet::from([CLAIMS.to_owned()]);

        let mut variables = Vec::with_capacity(cfg.variables.len());
        for var in &cfg.variables {
            if !is_identifier(&var.name) {
                return Err(PolicyConfigError::InvalidName(var.name.clone()));
            }
            if var.name == CLAIMS {
                return Err(PolicyConfigError::ReservedName);
            }
            if declared.contains(&var.name) {
                return Err(PolicyConfigError::DuplicateName(var.name.clone()));
            }
            let context = format!("auth.variables.{}", var.name);
            let expression = compile_checked(&var.expression, &context, &declared)?;
            declared.insert(var.name.clone());
            variables.push((var.name.clone(), expression));
        }

        let validations = cfg
            .validations
            .iter()
            .enumerate()
            .map(|(index, validation)| -> Result<Validation, PolicyConfigError> {
                let context = format!("auth.validations[{index}]");
                Ok(Validation {
                    expression: compile_checked(&validation.expression, &context, &declared)?,
                    message: validation.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ImpersonationConfig {
            ref username,
            ref groups,
        } = cfg.impersonation;
        let username = username
            .as_deref()
            .ok_or(PolicyConfigError::MissingUsername)
            .and_then(|src| compile_checked(src, "auth.impersonation.username", &declared))?;
        let groups = groups
            .as_deref()
            .map(|src| compile_checked(src, "auth.impersonation.groups", &declared))
            .transpose()?;

        Ok(Self {
            variables,
            validations,
            username,
            groups,
        })
    }

    /// Maps verified claims to the identity the user acts as.
    ///
    /// # Errors
    ///
    /// [`AuthenticationError::ValidationFailed`] with the configured message of
    /// the first validation that is false or cannot be evaluated, and
    /// [`AuthenticationError::MappingFailed`] when a variable or impersonation
    /// expression fails or the username comes out empty.
    pub fn map(&self, claims: Claims) -> Result<Identity, AuthenticationError> {
        let claims = Value::from(serde_json::Value::Object(claims));
        let mut ctx = Context::new().with(CLAIMS, claims);

        for &(ref name, ref expression) in &self.variables {
            let value = expression.evaluate(&ctx).map_err(|e| {
                AuthenticationError::MappingFailed(format!("variable '{name}': {e}"))
            })?;
            ctx.insert(name.clone(), value);
        }

        for validation in &self.validations {
            match validation.expression.evaluate_bool(&ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(claims = %claims_of(&ctx), message = %validation.message, "claim validation failed");
                    return Err(AuthenticationError::ValidationFailed(
                        validation.message.clone(),
                    ));
                }
                Err(e) => {
                    debug!(claims = %claims_of(&ctx), message = %validation.message, error = %e, "claim validation could not be evaluated");
                    return Err(AuthenticationError::ValidationFailed(
                        validation.message.clone(),
                    ));
                }
            }
        }

        let username = self
            .username
            .evaluate_string(&ctx)
            .map_err(|e| AuthenticationError::MappingFailed(format!("username: {e}")))?;
        if username.trim().is_empty() {
            debug!(claims = %claims_of(&ctx), "impersonation username is empty");
            return Err(AuthenticationError::MappingFailed(
                "username is empty".to_owned(),
            ));
        }

        let groups = match self.groups {
            Some(ref groups) => groups
                .evaluate_string_list(&ctx)
                .map_err(|e| AuthenticationError::MappingFailed(format!("groups: {e}")))?,
            None => Vec::new(),
        };

        Ok(Identity::new(
            username,
            groups.into_iter().filter(|g| !g.is_empty()),
        ))
    }
}

fn claims_of(ctx: &Context) -> &Value {
    ctx.get(CLAIMS).unwrap_or(&Value::Null)
}

fn compile_checked(
    src: &str,
    context: &str,
    declared: &BTreeSet<String>,
) -> Result<Expression, PolicyConfigError> {
    let expression = Expression::compile(src).map_err(|source| PolicyConfigError::Compile {
        context: context.to_owned(),
        source,
    })?;
    if let Some(unknown) = expression
        .identifiers()
        .iter()
        .find(|name| !declared.contains(*name))
    {
        return Err(PolicyConfigError::UnknownIdentifier {
            context: context.to_owned(),
            name: unknown.clone(),
        });
    }
    Ok(expression)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !matches!(name, "true" | "false" | "null" | "in")
}
