//! Breakpoint site management.
//!
//! Sites are created per load address and shared by every location that
//! resolves there. A software site is armed with a read, write, verify
//! sequence so a failed step never leaves a half-planted trap behind.

use std::sync::Arc;

use tracing::{debug, warn};

use super::Process;
use crate::breakpoints::{BreakpointLocation, BreakpointSite, BreakpointSiteId, SiteKind};
use crate::error::{WardenError, WardenResult};
use crate::types::Address;

impl Process
{
    /// Give `owner` a site at its address, creating and enabling one if needed.
    ///
    /// ## Errors
    ///
    /// Propagates the backend's failure to enable a new site; the site is
    /// taken back out of the list in that case.
    pub fn create_breakpoint_site(&self, owner: &Arc<BreakpointLocation>, use_hardware: bool) -> WardenResult<BreakpointSiteId>
    {
        let address = owner.address();
        let trap = self.architecture.software_trap_opcode();
        let (site, created) = self.site_list.find_or_insert_with(address, |id| {
            BreakpointSite::new(id, address, trap, Arc::clone(owner), use_hardware)
        });
        if !created {
            let owners = site.add_owner(Arc::clone(owner));
            owner.set_site_id(Some(site.id()));
            debug!(site = %site.id(), %address, owners, "added owner to existing site");
            return Ok(site.id());
        }

        let id = site.id();
        owner.set_site_id(Some(id));
        if let Err(error) = self.backend.enable_breakpoint_site(self, &site) {
            self.site_list.remove(id);
            for owner in site.owners() {
                owner.set_site_id(None);
            }
            return Err(error);
        }
        debug!(site = %id, %address, use_hardware, "created breakpoint site");
        Ok(id)
    }

    /// Drop `owner` from the site. The last owner out disables and removes it.
    ///
    /// ## Errors
    ///
    /// Fails when the site is unknown, or when the last owner leaves and the
    /// trap cannot be disarmed. The site is removed from the list either way.
    pub fn remove_owner_from_breakpoint_site(&self, owner: &BreakpointLocation, site_id: BreakpointSiteId) -> WardenResult<()>
    {
        let site = self
            .site_list
            .find_by_id(site_id)
            .ok_or(WardenError::BreakpointSiteNotFound(site_id.raw()))?;
        let remaining = site.remove_owner(owner.breakpoint_id(), owner.id());
        owner.set_site_id(None);
        if remaining > 0 {
            return Ok(());
        }

        let disabled = if site.is_enabled() {
            self.backend.disable_breakpoint_site(self, &site)
        } else {
            Ok(())
        };
        self.site_list.remove(site_id);
        debug!(site = %site_id, "removed breakpoint site, no owners left");
        if let Err(error) = &disabled {
            warn!(site = %site_id, address = %site.load_address(), %error, "failed to disable removed breakpoint site");
        }
        disabled
    }

    /// Disable and remove a site regardless of its owners.
    pub fn clear_breakpoint_site_by_id(&self, site_id: BreakpointSiteId) -> WardenResult<()>
    {
        let site = self
            .site_list
            .find_by_id(site_id)
            .ok_or(WardenError::BreakpointSiteNotFound(site_id.raw()))?;
        if site.is_enabled() {
            self.backend.disable_breakpoint_site(self, &site)?;
        }
        for owner in site.owners() {
            owner.set_site_id(None);
        }
        self.site_list.remove(site_id);
        Ok(())
    }

    /// Arm a site by id. Arming an armed site does nothing.
    pub fn enable_breakpoint_site_by_id(&self, site_id: BreakpointSiteId) -> WardenResult<()>
    {
        let site = self
            .site_list
            .find_by_id(site_id)
            .ok_or(WardenError::BreakpointSiteNotFound(site_id.raw()))?;
        if site.is_enabled() {
            return Ok(());
        }
        self.backend.enable_breakpoint_site(self, &site)
    }

    /// Disarm a site by id. Disarming a disarmed site does nothing.
    pub fn disable_breakpoint_site_by_id(&self, site_id: BreakpointSiteId) -> WardenResult<()>
    {
        let site = self
            .site_list
            .find_by_id(site_id)
            .ok_or(WardenError::BreakpointSiteNotFound(site_id.raw()))?;
        if !site.is_enabled() {
            return Ok(());
        }
        self.backend.disable_breakpoint_site(self, &site)
    }

    /// Disarm every site. Failures are logged.
    pub fn disable_all_breakpoint_sites(&self)
    {
        for site in self.site_list.sites() {
            if !site.is_enabled() {
                continue;
            }
            if let Err(error) = self.backend.disable_breakpoint_site(self, &site) {
                warn!(site = %site.id(), address = %site.load_address(), %error, "failed to disable breakpoint site");
            }
        }
    }

    /// Plant the site's trap opcode.
    ///
    /// Saves the original bytes, writes the trap, then reads it back. Goes
    /// straight to the backend: the bytes at the site must be the real ones.
    pub fn enable_software_breakpoint(&self, site: &BreakpointSite) -> WardenResult<()>
    {
        if site.is_enabled() {
            return Ok(());
        }
        let address = site.load_address();
        if !address.is_valid() {
            return Err(WardenError::breakpoint(
                address,
                "BreakpointSite contains an invalid load address.",
            ));
        }
        let trap = site.trap_opcode();
        if trap.is_empty() {
            return Err(WardenError::Unsupported(format!(
                "no software breakpoint trap opcode for {}",
                self.architecture
            )));
        }

        let mut saved = vec![0u8; trap.len()];
        if !self.read_exactly(address, &mut saved) {
            return Err(WardenError::breakpoint(address, "Unable to read memory at breakpoint address."));
        }
        site.set_saved_opcode(&saved);

        if !self.write_exactly(address, trap) {
            return Err(WardenError::breakpoint(address, "Unable to write breakpoint trap to memory."));
        }

        let mut verify = vec![0u8; trap.len()];
        if !self.read_exactly(address, &mut verify) {
            return Err(WardenError::breakpoint(
                address,
                "Unable to read memory to verify breakpoint trap.",
            ));
        }
        if verify != trap {
            return Err(WardenError::breakpoint(
                address,
                "failed to verify the breakpoint trap in memory.",
            ));
        }

        site.set_enabled(true);
        site.set_kind(SiteKind::Software);
        debug!(site = %site.id(), %address, "software breakpoint enabled");
        Ok(())
    }

    /// Restore the bytes a software trap displaced.
    ///
    /// If the trap is already gone the saved bytes are not written back,
    /// but memory is still checked against them.
    pub fn disable_software_breakpoint(&self, site: &BreakpointSite) -> WardenResult<()>
    {
        let address = site.load_address();
        if site.is_hardware() {
            return Err(WardenError::breakpoint(address, "Breakpoint site is a hardware breakpoint."));
        }
        if !site.is_enabled() {
            return Ok(());
        }

        let trap = site.trap_opcode();
        let saved = site.saved_opcode();
        let mut current = vec![0u8; trap.len()];
        if !self.read_exactly(address, &mut current) {
            return Err(WardenError::breakpoint(
                address,
                "Unable to read memory that should contain the breakpoint trap.",
            ));
        }

        let trap_present = current == trap;
        if trap_present {
            if !self.write_exactly(address, &saved) {
                return Err(WardenError::breakpoint(
                    address,
                    "Memory write failed when restoring original opcode.",
                ));
            }
        } else {
            warn!(site = %site.id(), %address, "breakpoint trap is no longer in memory");
        }

        let mut verify = vec![0u8; saved.len()];
        if !self.read_exactly(address, &mut verify) {
            return Err(WardenError::breakpoint(
                address,
                "Failed to read memory to verify that breakpoint trap was restored.",
            ));
        }
        if verify.as_slice() != saved.as_slice() {
            let message = if trap_present {
                "Failed to restore original opcode."
            } else {
                "Original breakpoint trap is no longer in memory."
            };
            return Err(WardenError::breakpoint(address, message));
        }

        site.set_enabled(false);
        debug!(site = %site.id(), %address, "software breakpoint disabled");
        Ok(())
    }

    fn read_exactly(&self, address: Address, buffer: &mut [u8]) -> bool
    {
        matches!(self.backend.do_read_memory(address, buffer), Ok(read) if read == buffer.len())
    }

    fn write_exactly(&self, address: Address, data: &[u8]) -> bool
    {
        let written = matches!(self.backend.do_write_memory(address, data), Ok(count) if count == data.len());
        if written {
            self.memory_cache.flush(address, data.len());
            self.bump_memory_id();
        }
        written
    }
}
