//! ERC20 contract binding used by the token deposit conductor and the
//! withdrawal conductor's token-transfer path.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Standard ERC20 interface.
    #[sol(rpc)]
    contract ERC20 {
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
        event Approval(address indexed owner, address indexed spender, uint256 value);
    }
}
