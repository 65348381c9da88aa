//! Minimal read-only ABI interfaces for the three watched contract families.
//!
//! Only the accessors the monitor actually reads are declared. A deployed
//! contract version that lacks one of these functions simply reverts on the
//! call, which the contract monitor treats as "counter unknown".

use alloy::sol;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IRewardClaim {
        function totalClaims() external view returns (uint256);
        function isActive() external view returns (bool);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IJobEscrow {
        function totalJobs() external view returns (uint256);
        function cancelledJobs() external view returns (uint256);
        function isActive() external view returns (bool);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    contract ITokenDistributor {
        function totalDistributed() external view returns (uint256);
        function availableBalance() external view returns (uint256);
        function isActive() external view returns (bool);
    }
}
