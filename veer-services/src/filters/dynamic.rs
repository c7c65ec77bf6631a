//! Filters steering backend resolution.
use std::rc::Rc;

use async_trait::async_trait;
use http::Uri;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

use crate::proxy::PRESERVE_HOST_BAG_KEY;

/// Set the target of a `dynamic` backend route.
pub(super) struct SetDynamicBackendUrl {
    authority: String,
    scheme: http::uri::Scheme,
}

impl SetDynamicBackendUrl {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        let uri: Uri = args
            .string_at(0)?
            .parse()
            .map_err(|e| CreateError::invalid_arg(0, format!("invalid url: {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| CreateError::invalid_arg(0, "url has no host"))?
            .to_string();
        let scheme = uri.scheme().cloned().unwrap_or(http::uri::Scheme::HTTP);
        Ok(Rc::new(Self { authority, scheme }))
    }
}

#[async_trait(?Send)]
impl Filter for SetDynamicBackendUrl {
    async fn request(&self, ctx: &mut FilterContext) {
        ctx.set_outgoing_host(self.authority.clone());
        ctx.set_outgoing_scheme(self.scheme.clone());
    }
}

/// Override the global host rewrite policy for this route.
pub(super) struct PreserveHost {
    preserve: bool,
}

impl PreserveHost {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        let preserve = match args[0].as_bool() {
            Some(b) => b,
            // accept "true"/"false" strings as well
            None => match args[0].as_str() {
                Some("true") => true,
                Some("false") => false,
                _ => return Err(CreateError::invalid_arg(0, "expected a boolean")),
            },
        };
        Ok(Rc::new(Self { preserve }))
    }
}

#[async_trait(?Send)]
impl Filter for PreserveHost {
    async fn request(&self, ctx: &mut FilterContext) {
        ctx.state_bag_mut()
            .insert(PRESERVE_HOST_BAG_KEY.to_string(), Rc::new(self.preserve));
    }
}
