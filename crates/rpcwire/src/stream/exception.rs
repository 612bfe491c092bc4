// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! User exceptions: application-defined errors raised by remote operations.

use std::any::Any;
use std::fmt;

use super::input::InputStream;
use super::output::OutputStream;
use super::value::SlicedData;
use crate::error::Result;

/// An application exception marshaled as a stack of slices.
///
/// Unlike class instances, exceptions are never shared and are always
/// encoded inline.
pub trait UserException: fmt::Debug + Send + Any {
    /// Type id of the most-derived exception type.
    fn class_id(&self) -> &str;

    /// True when a member (at any slice) is class-typed. Under 1.0 the
    /// pending instances are then written after the exception.
    fn uses_classes(&self) -> bool {
        false
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()>;

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()>;

    fn sliced_data(&self) -> Option<&SlicedData> {
        None
    }

    fn sliced_data_mut(&mut self) -> Option<&mut Option<SlicedData>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn UserException {
    pub fn downcast_ref<E: UserException>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}

pub(crate) fn marshal_exception(ex: &dyn UserException, os: &mut OutputStream) -> Result<()> {
    os.start_exception(ex.sliced_data())?;
    ex.write_impl(os)?;
    os.end_exception()
}

pub(crate) fn unmarshal_exception(ex: &mut dyn UserException, is: &mut InputStream) -> Result<()> {
    is.start_exception()?;
    ex.read_impl(is)?;
    let preserve = ex.sliced_data_mut().is_some();
    let sliced = is.end_exception(preserve)?;
    if let Some(slot) = ex.sliced_data_mut() {
        *slot = sliced;
    }
    Ok(())
}
