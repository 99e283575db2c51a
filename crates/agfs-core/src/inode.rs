//! Inode lifecycle: create, remove, chown and lookup.

use crate::{Filesystem, finish};
use agfs_alloc::AgLockSet;
use agfs_error::{AgfsError, Result};
use agfs_inode::{
    Freed, InodeLocation, dialloc, difree, imap, imap_untrusted, read_dinode, write_dinode,
};
use agfs_ondisk::DinodeCore;
use agfs_trans::resv::create_block_res;
use agfs_trans::{Owner, QuotaResource, Transaction};
use agfs_types::InodeNumber;
use tracing::{debug, error};

fn owner_of(core: &DinodeCore) -> Owner {
    Owner {
        uid: core.uid,
        gid: core.gid,
        projid: core.projid,
    }
}

impl Filesystem {
    /// Allocate an inode near `parent` and initialise it for `owner`.
    /// `NoSpace` when no AG has a free inode or room for a new chunk.
    pub fn create_inode(
        &self,
        parent: Option<InodeNumber>,
        mode: u16,
        owner: Owner,
    ) -> Result<InodeNumber> {
        if mode == 0 {
            return Err(AgfsError::InvalidArgument("inode mode 0 marks a free slot".to_owned()));
        }
        let (mut locks, mut tp) = self.begin()?;
        let blocks = create_block_res(self.geometry());
        tp.reserve(&self.manager().resv().create, blocks, 0)?;
        let result = self.create_in(&mut tp, &mut locks, parent, mode, owner);
        finish(tp, result)
    }

    fn create_in(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        parent: Option<InodeNumber>,
        mode: u16,
        owner: Owner,
    ) -> Result<InodeNumber> {
        tp.reserve_quota(&owner, 0, 1)?;
        let Some(ino) = dialloc(tp, locks, parent, self.policy())? else {
            return Err(AgfsError::NoSpace);
        };
        let loc = imap(tp, ino)?;
        let old = read_dinode(tp, &loc)?;
        if !old.is_unused() {
            error!(
                ino = ino.0,
                mode = old.mode,
                nlink = old.nlink,
                invariant = "free_inode_slot_unused",
                "fs_inode_invariant_violation"
            );
            return Err(AgfsError::corruption(
                loc.block.0,
                format!("free inode {} has mode {:#o}", ino.0, old.mode),
            ));
        }
        let core = DinodeCore {
            mode,
            uid: owner.uid,
            gid: owner.gid,
            projid: owner.projid,
            nlink: 1,
            nblocks: 0,
            generation: old.generation.wrapping_add(1),
            ..old
        };
        write_dinode(tp, &loc, &core)?;
        tp.mod_owner_quota(&owner, QuotaResource::Inodes, 1)?;
        debug!(ino = ino.0, parent = ?parent, mode, uid = owner.uid, "fs_inode_created");
        Ok(ino)
    }

    /// Free `ino`. Its blocks must already be freed.
    pub fn remove_inode(&self, ino: InodeNumber) -> Result<Freed> {
        let (mut locks, mut tp) = self.begin()?;
        tp.reserve(&self.manager().resv().remove, 0, 0)?;
        let result = self.remove_in(&mut tp, &mut locks, ino);
        finish(tp, result)
    }

    fn remove_in(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        ino: InodeNumber,
    ) -> Result<Freed> {
        // An unused slot is still handed to the inode tree, which tells a
        // double free from a stale slot.
        let (loc, core) = self.locate_slot(tp, locks, ino)?;
        if core.nblocks != 0 {
            return Err(AgfsError::InvalidArgument(format!(
                "inode {} still owns {} blocks",
                ino.0, core.nblocks
            )));
        }
        let freed = difree(tp, locks, ino, self.policy())?;
        if freed == Freed::Inode {
            write_dinode(tp, &loc, &DinodeCore::unused(core.generation))?;
        }
        if !core.is_unused() {
            tp.mod_owner_quota(&owner_of(&core), QuotaResource::Inodes, -1)?;
        }
        debug!(ino = ino.0, freed = ?freed, "fs_inode_removed");
        Ok(freed)
    }

    /// Hand `ino` and its blocks over to `new_owner`, moving the quota
    /// usage between the two sets of dquots.
    pub fn chown(&self, ino: InodeNumber, new_owner: Owner) -> Result<()> {
        let (mut locks, mut tp) = self.begin()?;
        tp.reserve(&self.manager().resv().chown, 0, 0)?;
        let result = self.chown_in(&mut tp, &mut locks, ino, new_owner);
        finish(tp, result)
    }

    fn chown_in(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        ino: InodeNumber,
        new_owner: Owner,
    ) -> Result<()> {
        let (loc, core) = self.locate(tp, locks, ino)?;
        let old_owner = owner_of(&core);
        if old_owner == new_owner {
            return Ok(());
        }
        tp.reserve_quota_chown(&old_owner, &new_owner, core.nblocks, 1)?;
        let core = DinodeCore {
            uid: new_owner.uid,
            gid: new_owner.gid,
            projid: new_owner.projid,
            ..core
        };
        write_dinode(tp, &loc, &core)?;
        debug!(ino = ino.0, from = old_owner.uid, to = new_owner.uid, "fs_inode_chowned");
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Where `ino` lives on disk. The inode number is checked against the
    /// inode tree, so numbers from outside the filesystem are safe.
    pub fn imap(&self, ino: InodeNumber) -> Result<InodeLocation> {
        let (mut locks, mut tp) = self.begin()?;
        let result = self
            .lock_ino(&mut locks, ino)
            .and_then(|()| imap_untrusted(&mut tp, ino));
        tp.cancel();
        result
    }

    /// The core of an inode in use.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<DinodeCore> {
        let (mut locks, mut tp) = self.begin()?;
        let result = self.locate(&mut tp, &mut locks, ino).map(|(_, core)| core);
        tp.cancel();
        result
    }
}
